use uuid::Uuid;

use shared_config::AppConfig;

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub redis_url: Option<String>,
    pub signaling_topic_prefix: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            redis_url: None,
            signaling_topic_prefix: "test-consultation".to_string(),
        }
    }
}

impl TestConfig {
    /// Points the record sink at a mock server.
    pub fn with_supabase_url(mut self, url: impl Into<String>) -> Self {
        self.supabase_url = url.into();
        self
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            redis_url: self.redis_url.clone(),
            ice_server_urls: Vec::new(),
            signaling_topic_prefix: self.signaling_topic_prefix.clone(),
        }
    }
}

pub struct TestParticipant {
    pub id: Uuid,
}

impl TestParticipant {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

/// One consultation with its two participants.
pub struct TestConsultation {
    pub session_id: Uuid,
    pub doctor: TestParticipant,
    pub patient: TestParticipant,
}

impl Default for TestConsultation {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            doctor: TestParticipant::new(),
            patient: TestParticipant::new(),
        }
    }
}

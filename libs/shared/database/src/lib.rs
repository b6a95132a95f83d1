pub mod supabase;

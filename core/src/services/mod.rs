pub mod notify;
pub mod preferences;

pub mod context;
pub mod password;

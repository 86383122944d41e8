pub mod serializer;
pub mod time;
pub mod utils;

pub mod tokio;

//! Goal-keeping mentor bot core: Gen-API task client, response extraction and
//! the per-conversation goal flow. Transports live in the `mentor` binary.

pub mod config;
pub mod conversation;
pub mod extractor;
pub mod genapi;
pub mod http_client;
pub mod prompts;
pub mod task_client;
pub mod transport;

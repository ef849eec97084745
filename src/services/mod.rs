pub mod agent;
pub mod chat_agent;
pub mod completion;
pub mod instructions;
pub mod job_store;
pub mod output;
pub mod pool;
pub mod reconciler;
pub mod retry;
pub mod seed;
pub mod sink;
pub mod worker;

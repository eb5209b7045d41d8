//! Providers module - the model backend contract
//!
//! The engine talks to models only through [`LLMProvider`]. Concrete HTTP
//! clients live outside this crate; [`RetryProvider`] decorates any of them
//! with backoff on transient failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use relayclaw::providers::{LLMProvider, ChatOptions};
//! use relayclaw::session::Message;
//!
//! async fn example(provider: &dyn LLMProvider) {
//!     let messages = vec![Message::user("Hello!")];
//!     let options = ChatOptions::new().with_max_tokens(1000);
//!
//!     let response = provider.chat(messages, vec![], None, options).await.unwrap();
//!     println!("Response: {}", response.content);
//! }
//! ```

pub mod retry;
mod types;

pub use retry::RetryProvider;
pub use types::{
    ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ProviderSlot, ToolDefinition, Usage,
};

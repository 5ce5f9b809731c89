//! PrivChat 实时投递服务
//!
//! 一对一聊天的实时层：在线状态、WebSocket 频道广播、消息投递状态机、
//! 会话聚合（最后一条消息 / 未读数）以及 WebRTC 信令转发。

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod http;
pub mod infra;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod service;

pub use config::ServerConfig;
pub use context::SessionContext;
pub use error::{Result, ServerError};
pub use handler::{EventDispatcher, EventHandler};
pub use infra::{Channel, EventEmitter, RealtimeHub};
pub use model::*;
pub use protocol::{ClientEvent, ServerEvent};
pub use server::{RealtimeServer, RealtimeServices};

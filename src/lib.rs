/// Tunnel Relay 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod buffer_pool;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod mux;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tls;
pub mod transport;
pub mod tunnel;

// 重新导出常用类型
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use config::{AppConfig, ClientConfig, Direction, GatewayConfig, HostConfig, TunnelSpec};
pub use engine::Engine;
pub use error::{PoolError, Result, TunnelError};
pub use gateway::Gateway;
pub use registry::{ConnectionKey, ConnectionRegistry, RelayedConnection};
pub use session::{SessionManager, SessionState};

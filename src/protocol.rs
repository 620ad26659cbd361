/// 客户端与网关之间的协议消息定义
///
/// 帧格式：4 字节大端长度前缀 + JSON
use crate::error::{Result, TunnelError};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 协议版本
pub const PROTOCOL_VERSION: u8 = 1;

/// 单帧最大长度
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// 认证请求（传输层建立后、yamux 之前发送）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub version: u8,
    pub user: String,
    pub password: String,
}

/// 认证响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: Some(message.into()),
        }
    }
}

/// 每个客户端打开的逻辑通道的首帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRequest {
    /// 由网关连接目标地址，之后通道承载原始字节
    Dial { target: String },
    /// 在网关侧监听，通道保持打开作为该监听器的控制通道
    Listen { bind: String, listener_id: u64 },
    /// 心跳
    Ping,
}

/// 网关对 [`StreamRequest`] 的应答
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StreamResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }

    /// 转换为 Result，失败时携带网关给出的原因
    pub fn into_result(self) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(TunnelError::Rejected(
                self.message.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }
}

/// 网关为远端监听器接受的每条连接打开的通道首帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundHeader {
    pub listener_id: u64,
    pub peer: String,
}

/// 写入一帧
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(msg)
        .map_err(|e| TunnelError::protocol(format!("Failed to encode frame: {}", e)))?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(TunnelError::protocol(format!(
            "Frame too large: {} bytes",
            json.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(4 + json.len());
    frame.put_u32(json.len() as u32);
    frame.extend_from_slice(&json);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一帧
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(TunnelError::protocol(format!(
            "Frame too large: {} bytes",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map_err(|e| TunnelError::protocol(format!("Malformed frame: {}", e)))
}

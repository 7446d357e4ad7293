//! Redis 配置和连接管理模块
//! Redis configuration and connection management module

use crate::error::Result;
use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionInfo, IntoConnectionInfo};

/// Redis 连接配置
/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConnectionConfig {
  connection_info: ConnectionInfo,
}

impl RedisConnectionConfig {
  /// 创建单机连接配置
  /// Create a standalone connection configuration
  pub fn single<T: IntoConnectionInfo>(connection_info: T) -> Result<Self> {
    Ok(Self {
      connection_info: connection_info.into_connection_info()?,
    })
  }

  /// 从 URL 创建，例如 `redis://127.0.0.1:6379/0`
  /// Create from a URL such as `redis://127.0.0.1:6379/0`
  pub fn from_url(url: &str) -> Result<Self> {
    Self::single(url)
  }

  pub fn connection_info(&self) -> &ConnectionInfo {
    &self.connection_info
  }

  /// 打开客户端（不建立连接）
  /// Open a client (does not connect yet)
  pub fn client(&self) -> Result<Client> {
    Ok(Client::open(self.connection_info.clone())?)
  }

  /// 打开客户端并建立多路复用连接
  /// Open a client and establish a multiplexed connection
  pub async fn connect(&self) -> Result<(Client, MultiplexedConnection)> {
    let client = self.client()?;
    let conn = client.get_multiplexed_async_connection().await?;
    Ok((client, conn))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_config_from_url() {
    let config = RedisConnectionConfig::from_url("redis://127.0.0.1:6379/2").unwrap();
    assert_eq!(config.connection_info().redis.db, 2);
    assert!(RedisConnectionConfig::from_url("not a url").is_err());
  }
}

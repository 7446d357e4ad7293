//! Redis Lua 脚本模块
//!
//! 任务记录的插入和比较并交换需要与未入队索引一起原子更新；领取续期需要先确认持有者。
//! 这些操作都通过 Lua 脚本完成。

use crate::error::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::{RedisWrite, ToRedisArgs};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub enum RedisArg {
  Int(i64),
  Str(String),
}

impl ToRedisArgs for RedisArg {
  fn write_redis_args<W>(&self, out: &mut W)
  where
    W: ?Sized + RedisWrite,
  {
    match self {
      RedisArg::Int(i) => i.write_redis_args(out),
      RedisArg::Str(s) => s.write_redis_args(out),
    }
  }
}

/// 任务记录脚本
pub mod scripts {
  /// 插入任务记录
  /// `KEYS[1]` -> dispatchq:task:<task_id>
  /// `KEYS[2]` -> dispatchq:tasks:unqueued
  /// `ARGV[1]` -> 版本
  /// `ARGV[2]` -> 记录 JSON
  /// `ARGV[3]` -> 是否等待入队（1/0）
  /// `ARGV[4]` -> eligible_at 毫秒
  /// `ARGV[5]` -> task_id
  ///
  /// 返回：1 写入成功，0 记录已存在
  pub const INSERT_TASK: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
redis.call("HSET", KEYS[1], "version", ARGV[1], "data", ARGV[2])
if ARGV[3] == "1" then
  redis.call("ZADD", KEYS[2], ARGV[4], ARGV[5])
end
return 1
"#;

  /// 比较并交换任务记录
  /// `KEYS[1]` -> dispatchq:task:<task_id>
  /// `KEYS[2]` -> dispatchq:tasks:unqueued
  /// `ARGV[1]` -> 期望的版本
  /// `ARGV[2]` -> 新版本
  /// `ARGV[3]` -> 记录 JSON
  /// `ARGV[4]` -> 是否等待入队（1/0）
  /// `ARGV[5]` -> eligible_at 毫秒
  /// `ARGV[6]` -> task_id
  ///
  /// 返回：1 写入成功，0 版本不匹配，-1 记录不存在
  pub const CAS_TASK: &str = r#"
local version = redis.call("HGET", KEYS[1], "version")
if not version then
  return -1
end
if version ~= ARGV[1] then
  return 0
end
redis.call("HSET", KEYS[1], "version", ARGV[2], "data", ARGV[3])
if ARGV[4] == "1" then
  redis.call("ZADD", KEYS[2], ARGV[5], ARGV[6])
else
  redis.call("ZREM", KEYS[2], ARGV[6])
end
return 1
"#;

  /// 续期领取：仅当条目仍由该消费者持有时重置其空闲时间，不增加投递次数
  /// `KEYS[1]` -> dispatchq:{`<topic>`}:stream
  /// `ARGV[1]` -> 消费者组
  /// `ARGV[2]` -> 消费者
  /// `ARGV[3]` -> 条目 ID
  ///
  /// 返回：1 已续期，0 领取不属于该消费者
  pub const EXTEND_CLAIM: &str = r#"
local pending = redis.call("XPENDING", KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1)
if #pending == 0 or pending[1][2] ~= ARGV[2] then
  return 0
end
redis.call("XCLAIM", KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], "JUSTID")
return 1
"#;

  /// 确认条目，并删除所有消费者组都已投递且确认的前缀条目
  /// `KEYS[1]` -> dispatchq:{`<topic>`}:stream
  /// `ARGV[1]` -> 消费者组
  /// `ARGV[2]` -> 条目 ID
  ///
  /// 每个组的下界是最小的待确认 ID，没有待确认条目时是最后投递 ID 的下一个
  ///
  /// 返回：确认的条目数
  pub const ACK_TRIM: &str = r#"
local acked = redis.call("XACK", KEYS[1], ARGV[1], ARGV[2])
if acked == 0 then
  return 0
end
local function parse(id)
  local dash = string.find(id, "-", 1, true)
  return tonumber(string.sub(id, 1, dash - 1)), tonumber(string.sub(id, dash + 1))
end
local floor_ms, floor_seq
for _, info in ipairs(redis.call("XINFO", "GROUPS", KEYS[1])) do
  local fields = {}
  for i = 1, #info, 2 do
    fields[info[i]] = info[i + 1]
  end
  local ms, seq
  if fields["pending"] > 0 then
    local summary = redis.call("XPENDING", KEYS[1], fields["name"])
    ms, seq = parse(summary[2])
  else
    ms, seq = parse(fields["last-delivered-id"])
    seq = seq + 1
  end
  if floor_ms == nil or ms < floor_ms or (ms == floor_ms and seq < floor_seq) then
    floor_ms, floor_seq = ms, seq
  end
end
if floor_ms ~= nil then
  redis.call("XTRIM", KEYS[1], "MINID", string.format("%d-%d", floor_ms, floor_seq))
end
return acked
"#;
}

const ALL_SCRIPT: [(&str, &str); 4] = [
  ("insert_task", scripts::INSERT_TASK),
  ("cas_task", scripts::CAS_TASK),
  ("extend_claim", scripts::EXTEND_CLAIM),
  ("ack_trim", scripts::ACK_TRIM),
];

fn script_source(name: &str) -> Option<&'static str> {
  ALL_SCRIPT
    .iter()
    .find(|(n, _)| *n == name)
    .map(|(_, script)| *script)
}

/// Redis 脚本管理器
#[derive(Debug, Default)]
pub struct ScriptManager {
  /// 脚本SHA缓存
  script_sha1: HashMap<&'static str, String>,
}

impl ScriptManager {
  /// 预加载所有脚本
  pub async fn load_scripts(&mut self, conn: &mut MultiplexedConnection) -> Result<()> {
    for (name, script) in ALL_SCRIPT {
      let sha = self.load_script(conn, script).await?;
      self.script_sha1.insert(name, sha);
    }
    Ok(())
  }

  pub async fn load_script(&self, conn: &mut MultiplexedConnection, script: &str) -> Result<String> {
    let sha: String = redis::cmd("SCRIPT")
      .arg("LOAD")
      .arg(script)
      .query_async(conn)
      .await?;
    Ok(sha)
  }

  /// 获取脚本SHA
  pub fn get_script_sha(&self, name: &str) -> Option<&String> {
    self.script_sha1.get(name)
  }

  /// 执行脚本，脚本缓存被清空时退回 EVAL
  pub async fn eval_script<T>(
    &self,
    conn: &mut MultiplexedConnection,
    script_name: &str,
    keys: &[String],
    args: &[RedisArg],
  ) -> Result<T>
  where
    T: redis::FromRedisValue,
  {
    let sha = self
      .get_script_sha(script_name)
      .ok_or_else(|| Error::other(format!("Script not loaded: {script_name}")))?;

    match redis::cmd("EVALSHA")
      .arg(sha)
      .arg(keys.len())
      .arg(keys)
      .arg(args)
      .query_async::<T>(conn)
      .await
    {
      Ok(result) => Ok(result),
      Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
        let script = script_source(script_name)
          .ok_or_else(|| Error::other(format!("Unknown script: {script_name}")))?;
        let result = redis::cmd("EVAL")
          .arg(script)
          .arg(keys.len())
          .arg(keys)
          .arg(args)
          .query_async::<T>(conn)
          .await?;
        Ok(result)
      }
      Err(e) => Err(e.into()),
    }
  }
}

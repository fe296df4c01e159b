//! Server-side Lua scripts.
//!
//! Redis runs each script atomically, which is what turns the read-compare-
//! write of compare-and-set and the read-increment-expire of windowed counters
//! into single linearizable operations.

use std::sync::LazyLock;

use redis::Script;

/// Compare-and-set.
///
/// `KEYS[1]` target key. `ARGV[1]` is `"1"` when a current value is expected
/// and `"0"` for insert-if-absent; `ARGV[2]` expected value; `ARGV[3]` new
/// value; `ARGV[4]` TTL in milliseconds, `0` to keep the existing TTL.
///
/// Returns `1` on success and `0` when the precondition failed.
pub(crate) static COMPARE_AND_SET: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
elseif current then
    redis.call('SET', KEYS[1], ARGV[3], 'KEEPTTL')
else
    redis.call('SET', KEYS[1], ARGV[3])
end
return 1
",
    )
});

/// Windowed increment.
///
/// `KEYS[1]` counter key. `ARGV[1]` window in milliseconds. The window starts
/// when the counter is created and is never extended by later increments.
///
/// Returns `{value, remaining_ms}`.
pub(crate) static INCREMENT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local remaining = redis.call('PTTL', KEYS[1])
if remaining < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    remaining = tonumber(ARGV[1])
end
return {value, remaining}
",
    )
});

//! Canned atomic procedures and their Lua bodies.

use std::fmt;

/// Increment a window counter, arming its TTL only when the increment
/// created it. Returns the post-increment value.
pub(crate) const PERIOD_INCREMENT_LUA: &str = r#"
local ttl = tonumber(ARGV[1])
local current = redis.call("INCRBY", KEYS[1], 1)
if current == 1 then
    redis.call("EXPIRE", KEYS[1], ttl)
end
return current
"#;

/// Overwrite a verification entry and reset its mismatch counter.
pub(crate) const VERIFIED_GENERATE_LUA: &str = r#"
local quota = tonumber(ARGV[2])
local expiry = tonumber(ARGV[3])
redis.call("DEL", KEYS[1])
redis.call("HSET", KEYS[1], "value", ARGV[1], "quota", quota, "err", 0)
redis.call("EXPIRE", KEYS[1], expiry)
return 0
"#;

/// Compare a candidate; delete on success or on the exhausting mismatch.
pub(crate) const VERIFIED_MATCH_LUA: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return 1
end
local want = redis.call("HGET", KEYS[1], "value")
if want == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 0
end
local quota = tonumber(redis.call("HGET", KEYS[1], "quota"))
local errs = redis.call("HINCRBY", KEYS[1], "err", 1)
if errs >= quota then
    redis.call("DEL", KEYS[1])
    return 3
end
return 2
"#;

/// Reply codes of [`Procedure::VerifiedMatch`].
pub(crate) mod match_code {
    pub const SUCCESS: i64 = 0;
    pub const NOT_FOUND: i64 = 1;
    pub const MISMATCH: i64 = 2;
    pub const EXHAUSTED: i64 = 3;
}

/// Reply code of [`Procedure::VerifiedGenerate`].
pub(crate) const GENERATE_OK: i64 = 0;

/// The atomic procedures a store must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    /// KEYS = [counter], ARGV = [ttl_secs]; returns the new counter value.
    PeriodIncrement,
    /// KEYS = [entry], ARGV = [value, quota, expiry_secs]; returns 0.
    VerifiedGenerate,
    /// KEYS = [entry], ARGV = [candidate]; returns a match code.
    VerifiedMatch,
}

impl Procedure {
    /// All procedures, in registration order.
    pub const ALL: [Procedure; 3] = [
        Procedure::PeriodIncrement,
        Procedure::VerifiedGenerate,
        Procedure::VerifiedMatch,
    ];

    /// The Lua body executed by script-capable stores.
    pub fn lua(&self) -> &'static str {
        match self {
            Procedure::PeriodIncrement => PERIOD_INCREMENT_LUA,
            Procedure::VerifiedGenerate => VERIFIED_GENERATE_LUA,
            Procedure::VerifiedMatch => VERIFIED_MATCH_LUA,
        }
    }

    /// Number of keys and arguments the procedure expects.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Procedure::PeriodIncrement => (1, 1),
            Procedure::VerifiedGenerate => (1, 3),
            Procedure::VerifiedMatch => (1, 1),
        }
    }

    /// Stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::PeriodIncrement => "period_increment",
            Procedure::VerifiedGenerate => "verified_generate",
            Procedure::VerifiedMatch => "verified_match",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_procedure_has_a_body() {
        for procedure in Procedure::ALL {
            assert!(procedure.lua().contains("KEYS[1]"), "{procedure}");
            assert_eq!(procedure.arity().0, 1);
        }
    }

    #[test]
    fn test_increment_only_arms_ttl_on_create() {
        assert!(PERIOD_INCREMENT_LUA.contains("if current == 1 then"));
    }
}

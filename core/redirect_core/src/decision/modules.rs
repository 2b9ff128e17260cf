//! Built-in decision modules.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use super::{DecisionContext, DecisionModule, ModuleConfig, Verdict};

pub const SOURCE_TIME_FILE: &str = "source_time.bin";

// ============================================================================
// yesno
// ============================================================================

/// Static answer: `value` = `yes` accepts, anything else rejects.
pub struct YesNo;

impl DecisionModule for YesNo {
    fn name(&self) -> &str {
        "yesno"
    }

    fn evaluate(&self, ctx: &DecisionContext<'_>, config: &ModuleConfig) -> Verdict {
        match config.get("value").map(String::as_str) {
            Some("yes") => Verdict::Accept,
            Some(_) => Verdict::Reject,
            None => {
                log::warn!("flow {}: yesno without a value", ctx.conn.id);
                Verdict::Defer
            }
        }
    }
}

// ============================================================================
// random
// ============================================================================

/// Accepts one flow out of `value` on average.
pub struct Random {
    rng: SystemRandom,
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Random {
    pub fn new() -> Self {
        Random {
            rng: SystemRandom::new(),
        }
    }

    /// Uniform draw in [0, 1).
    fn unit(&self) -> Option<f64> {
        let mut buf = [0u8; 4];
        self.rng.fill(&mut buf).ok()?;
        Some(f64::from(u32::from_be_bytes(buf)) / 4_294_967_296.0)
    }
}

/// ACCEPT iff floor(value * r) == 1.
pub fn random_verdict(value: u32, r: f64) -> Verdict {
    if value < 1 {
        return Verdict::Reject;
    }
    if (f64::from(value) * r).floor() as u64 == 1 {
        Verdict::Accept
    } else {
        Verdict::Reject
    }
}

impl DecisionModule for Random {
    fn name(&self) -> &str {
        "random"
    }

    fn evaluate(&self, ctx: &DecisionContext<'_>, config: &ModuleConfig) -> Verdict {
        let Some(value) = config.get("value").and_then(|v| v.parse::<u32>().ok()) else {
            log::warn!("flow {}: random needs an integer value", ctx.conn.id);
            return Verdict::Defer;
        };
        match self.unit() {
            Some(r) => random_verdict(value, r),
            None => {
                log::warn!("flow {}: random number generator failed", ctx.conn.id);
                Verdict::Defer
            }
        }
    }
}

// ============================================================================
// source_time
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub count: u64,
    /// Unix seconds
    pub first_seen: u64,
    /// Seconds between first and latest sighting
    pub duration: u64,
}

impl SourceRecord {
    fn fresh(now: u64) -> Self {
        SourceRecord {
            count: 1,
            first_seen: now,
            duration: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTimeParams {
    pub expiration: u64,
    pub deny_after: u64,
    pub allow_after: u64,
}

impl Default for SourceTimeParams {
    fn default() -> Self {
        SourceTimeParams {
            expiration: 24 * 3600,
            deny_after: 1200,
            allow_after: 0,
        }
    }
}

impl SourceTimeParams {
    /// Defaults overridden by numeric config entries.
    pub fn from_config(config: &ModuleConfig) -> Self {
        let mut params = Self::default();
        let get = |key: &str| config.get(key).and_then(|v| v.parse::<u64>().ok());
        if let Some(v) = get("expiration") {
            params.expiration = v;
        }
        if let Some(v) = get("deny_after") {
            params.deny_after = v;
        }
        if let Some(v) = get("allow_after") {
            params.allow_after = v;
        }
        params
    }
}

/// Accepts a source only inside a time window after it was first seen.
pub struct SourceTime {
    records: Mutex<HashMap<Ipv4Addr, SourceRecord>>,
    backup: Option<PathBuf>,
}

impl SourceTime {
    pub fn in_memory() -> Self {
        SourceTime {
            records: Mutex::new(HashMap::new()),
            backup: None,
        }
    }

    /// Load records from `path` if it exists; save back there after each decision.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let records = match fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        log::info!(
            "source_time: {} known sources loaded from {}",
            records.len(),
            path.display()
        );
        Ok(SourceTime {
            records: Mutex::new(records),
            backup: Some(path),
        })
    }

    pub fn record(&self, src: Ipv4Addr) -> Option<SourceRecord> {
        self.records.lock().get(&src).copied()
    }

    /// Decide for `src` at `now` (unix seconds) and update its record.
    pub fn decide(&self, src: Ipv4Addr, now: u64, params: &SourceTimeParams) -> Verdict {
        let fresh_verdict = if params.allow_after == 0 {
            Verdict::Accept
        } else {
            Verdict::Reject
        };

        let mut records = self.records.lock();
        let renew = records
            .get(&src)
            .map(|r| r.duration > params.expiration)
            .unwrap_or(true);
        let verdict = if renew {
            records.insert(src, SourceRecord::fresh(now));
            fresh_verdict
        } else {
            let rec = records
                .entry(src)
                .or_insert_with(|| SourceRecord::fresh(now));
            let allowed = rec.first_seen.saturating_add(params.allow_after) <= now
                && now <= rec.first_seen.saturating_add(params.deny_after);
            rec.count += 1;
            rec.duration = now.saturating_sub(rec.first_seen);
            if allowed {
                Verdict::Accept
            } else {
                Verdict::Reject
            }
        };

        if let Err(e) = self.save(&records) {
            log::warn!("source_time: cannot save state: {}", e);
        }
        verdict
    }

    fn save(&self, records: &HashMap<Ipv4Addr, SourceRecord>) -> io::Result<()> {
        let Some(path) = &self.backup else {
            return Ok(());
        };
        let bytes = bincode::serialize(records)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl DecisionModule for SourceTime {
    fn name(&self) -> &str {
        "source_time"
    }

    fn evaluate(&self, ctx: &DecisionContext<'_>, config: &ModuleConfig) -> Verdict {
        let params = SourceTimeParams::from_config(config);
        if params.allow_after >= params.deny_after {
            log::warn!(
                "flow {}: source_time misconfigured, allow_after >= deny_after",
                ctx.conn.id
            );
            return Verdict::Defer;
        }
        self.decide(*ctx.conn.ext_endpoint().ip(), unix_now(), &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    #[test]
    fn test_random_verdict() {
        assert_eq!(random_verdict(0, 0.99), Verdict::Reject);
        assert_eq!(random_verdict(1, 0.99), Verdict::Reject);
        assert_eq!(random_verdict(2, 0.5), Verdict::Accept);
        assert_eq!(random_verdict(2, 0.49), Verdict::Reject);
        assert_eq!(random_verdict(10, 0.15), Verdict::Accept);
        assert_eq!(random_verdict(10, 0.25), Verdict::Reject);
    }

    #[test]
    fn test_random_unit_range() {
        let r = Random::new();
        for _ in 0..100 {
            let u = r.unit().unwrap();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_source_time_window() {
        let st = SourceTime::in_memory();
        let params = SourceTimeParams::default();

        // First sighting accepted (allow_after = 0).
        assert_eq!(st.decide(SRC, 1000, &params), Verdict::Accept);
        // Within deny_after.
        assert_eq!(st.decide(SRC, 1500, &params), Verdict::Accept);
        // Past deny_after.
        assert_eq!(st.decide(SRC, 1000 + 1201, &params), Verdict::Reject);

        let rec = st.record(SRC).unwrap();
        assert_eq!(rec.count, 3);
        assert_eq!(rec.first_seen, 1000);
        assert_eq!(rec.duration, 1201);
    }

    #[test]
    fn test_source_time_allow_after_delays() {
        let st = SourceTime::in_memory();
        let params = SourceTimeParams {
            expiration: 86400,
            deny_after: 600,
            allow_after: 60,
        };
        assert_eq!(st.decide(SRC, 0, &params), Verdict::Reject);
        assert_eq!(st.decide(SRC, 30, &params), Verdict::Reject);
        assert_eq!(st.decide(SRC, 90, &params), Verdict::Accept);
    }

    #[test]
    fn test_source_time_huge_windows_saturate() {
        let st = SourceTime::in_memory();
        let never_deny = SourceTimeParams {
            expiration: u64::MAX,
            deny_after: u64::MAX,
            allow_after: 0,
        };
        assert_eq!(st.decide(SRC, 1000, &never_deny), Verdict::Accept);
        assert_eq!(st.decide(SRC, 5000, &never_deny), Verdict::Accept);

        let never_allow = SourceTimeParams {
            allow_after: u64::MAX - 1,
            ..never_deny
        };
        let other = Ipv4Addr::new(198, 51, 100, 77);
        assert_eq!(st.decide(other, 1000, &never_allow), Verdict::Reject);
        assert_eq!(st.decide(other, 5000, &never_allow), Verdict::Reject);
    }

    #[test]
    fn test_source_time_expired_entry_renewed() {
        let st = SourceTime::in_memory();
        let params = SourceTimeParams {
            expiration: 100,
            deny_after: 50,
            allow_after: 0,
        };
        st.decide(SRC, 0, &params);
        // duration becomes 200 > expiration, still rejected on this pass
        assert_eq!(st.decide(SRC, 200, &params), Verdict::Reject);
        // next sighting renews the entry
        assert_eq!(st.decide(SRC, 210, &params), Verdict::Accept);
        assert_eq!(st.record(SRC).unwrap().first_seen, 210);
        assert_eq!(st.record(SRC).unwrap().count, 1);
    }

    #[test]
    fn test_source_time_params_from_config() {
        let config: ModuleConfig = [
            ("deny_after".to_string(), "30".to_string()),
            ("allow_after".to_string(), "bogus".to_string()),
        ]
        .into_iter()
        .collect();
        let params = SourceTimeParams::from_config(&config);
        assert_eq!(params.deny_after, 30);
        assert_eq!(params.allow_after, 0);
        assert_eq!(params.expiration, 86400);
    }

    #[test]
    fn test_source_time_persistence() {
        let dir = std::env::temp_dir().join(format!("source_time_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(SOURCE_TIME_FILE);
        let _ = fs::remove_file(&path);

        let st = SourceTime::open(path.clone()).unwrap();
        st.decide(SRC, 500, &SourceTimeParams::default());
        drop(st);

        let reopened = SourceTime::open(path.clone()).unwrap();
        assert_eq!(
            reopened.record(SRC),
            Some(SourceRecord { count: 1, first_seen: 500, duration: 0 })
        );

        fs::write(&path, b"\xff").unwrap();
        assert!(SourceTime::open(path.clone()).is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}

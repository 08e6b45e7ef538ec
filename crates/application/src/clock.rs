//! 时钟抽象
//!
//! 服务端时间戳（INSERT 盖章、缓存取回时间、回写延迟窗口）都经由该抽象，
//! 测试中可以用手动时钟推进时间。

use chrono::{DateTime, Utc};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// 当前时间的毫秒时间戳
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// 系统时钟
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟（测试用）
pub mod manual {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    pub struct ManualClock {
        millis: AtomicI64,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                millis: AtomicI64::new(start.timestamp_millis()),
            })
        }

        pub fn advance_millis(&self, delta: i64) {
            self.millis.fetch_add(delta, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
                .unwrap_or_else(Utc::now)
        }
    }
}

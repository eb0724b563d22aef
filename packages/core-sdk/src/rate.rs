use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::RelayError;
use crate::models::ConversationKey;

const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
struct RateState {
    cooldown_until: Option<Instant>,
    // 每个会话最近一次放行的时间
    last_admitted: HashMap<ConversationKey, Instant>,
}

/**
 * \brief 请求闸门：会话级防抖 + 进程级冷却窗口。
 * \details 冷却窗口由上游 429/400 类错误延长，期间所有会话一律拒绝。
 */
pub struct RateGate {
    interval: Duration,
    cooldown: Duration,
    state: Mutex<RateState>,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(60))
    }
}

impl RateGate {
    /**
     * \param interval 同一会话两次放行的最小间隔
     * \param cooldown 观察到限流错误后的全局冷却时长
     */
    pub fn new(interval: Duration, cooldown: Duration) -> Self {
        Self {
            interval,
            cooldown,
            state: Mutex::new(RateState::default()),
        }
    }

    /**
     * \brief 判断该会话当前是否允许发起请求；放行即占用本窗口。
     */
    pub fn admit(&self, key: ConversationKey) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(until) = state.cooldown_until {
            if now < until {
                warn!(key, "request rejected during upstream cooldown");
                return false;
            }
        }

        if let Some(last) = state.last_admitted.get(&key) {
            if now.duration_since(*last) < self.interval {
                warn!(key, "request rejected by per-conversation limiter");
                return false;
            }
        }

        if state.last_admitted.len() >= PRUNE_THRESHOLD {
            let interval = self.interval;
            state
                .last_admitted
                .retain(|_, last| now.duration_since(*last) < interval);
        }
        state.last_admitted.insert(key, now);
        debug!(key, "request admitted");
        true
    }

    /**
     * \brief 把全局冷却截止时间推迟到 `now + duration`（只延长不缩短）。
     */
    pub fn extend_cooldown(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.cooldown_until.map_or(true, |current| current < until) {
            state.cooldown_until = Some(until);
        }
        warn!(secs = duration.as_secs(), "upstream throttled, cooldown extended");
    }

    /**
     * \brief 根据传输层错误决定是否进入冷却；返回是否已延长。
     */
    pub fn observe_failure(&self, err: &RelayError) -> bool {
        if err.is_throttling() {
            self.extend_cooldown(self.cooldown);
            true
        } else {
            false
        }
    }

    pub fn cooling_down(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .cooldown_until
            .map_or(false, |until| Instant::now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_once_per_interval() {
        let gate = RateGate::default();
        let admitted = [gate.admit(1), gate.admit(1)];
        assert_eq!(admitted.iter().filter(|ok| **ok).count(), 1);
        assert!(gate.admit(2));
    }

    #[test]
    fn test_admit_again_after_interval() {
        let gate = RateGate::new(Duration::from_millis(30), Duration::from_secs(60));
        assert!(gate.admit(1));
        assert!(!gate.admit(1));
        std::thread::sleep(Duration::from_millis(60));
        assert!(gate.admit(1));
    }

    #[test]
    fn test_throttling_error_blocks_fresh_keys() {
        let gate = RateGate::default();
        let err = RelayError::Status {
            status: reqwest::StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        assert!(gate.observe_failure(&err));
        assert!(gate.cooling_down());
        assert!(!gate.admit(12345));
    }

    #[test]
    fn test_non_throttling_error_does_not_cool_down() {
        let gate = RateGate::default();
        let err = RelayError::Status {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "400 tokens left".to_string(),
        };
        assert!(!gate.observe_failure(&err));
        assert!(gate.admit(1));
    }

    #[test]
    fn test_cooldown_never_shrinks() {
        let gate = RateGate::default();
        gate.extend_cooldown(Duration::from_secs(60));
        gate.extend_cooldown(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(gate.cooling_down());
    }
}

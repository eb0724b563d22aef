use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;

use crate::models::{CachedMessage, ConversationKey};

/**
 * \brief 模仿模式的近期消息缓存：每个会话只保留最近 `capacity` 条。
 */
pub struct MemoryCache {
    capacity: usize,
    window: Duration,
    inner: Mutex<HashMap<ConversationKey, VecDeque<CachedMessage>>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(10 * 60))
    }
}

impl MemoryCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /**
     * \brief 追加一条消息，超出容量时丢弃最旧的。
     */
    pub fn observe(&self, key: ConversationKey, message: CachedMessage) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = inner.entry(key).or_default();
        queue.push_back(message);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    /**
     * \brief 取出窗口内的消息快照，不修改缓存。
     */
    pub fn drain_recent(&self, key: ConversationKey, window: Duration) -> Vec<CachedMessage> {
        let cutoff = OffsetDateTime::now_utc() - window;
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(&key)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|msg| msg.timestamp > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self, key: ConversationKey) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.remove(&key);
    }

    /**
     * \brief 把窗口内的消息逐条格式化为上下文片段。
     */
    pub fn render_recent(&self, key: ConversationKey) -> Vec<String> {
        self.drain_recent(key, self.window)
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str, age: Duration) -> CachedMessage {
        CachedMessage {
            timestamp: OffsetDateTime::now_utc() - age,
            uid: 1,
            nickname: "bob".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_observe_trims_to_capacity() {
        let cache = MemoryCache::new(3, Duration::from_secs(600));
        for i in 0..4 {
            cache.observe(7, message(&format!("m{}", i), Duration::ZERO));
        }
        let recent = cache.drain_recent(7, cache.window());
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "m1");
        assert_eq!(recent[2].content, "m3");
    }

    #[test]
    fn test_drain_recent_excludes_stale_entries() {
        let cache = MemoryCache::default();
        cache.observe(7, message("old", Duration::from_secs(11 * 60)));
        cache.observe(7, message("fresh", Duration::from_secs(30)));
        let recent = cache.drain_recent(7, Duration::from_secs(10 * 60));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "fresh");
        // 不修改缓存
        assert_eq!(cache.drain_recent(7, Duration::from_secs(3600)).len(), 2);
    }

    #[test]
    fn test_clear_scoped_to_key() {
        let cache = MemoryCache::default();
        cache.observe(1, message("a", Duration::ZERO));
        cache.observe(2, message("b", Duration::ZERO));
        cache.clear(1);
        assert!(cache.drain_recent(1, cache.window()).is_empty());
        assert_eq!(cache.drain_recent(2, cache.window()).len(), 1);
    }

    #[test]
    fn test_render_recent_formats_entries() {
        let cache = MemoryCache::default();
        cache.observe(1, message("hello", Duration::ZERO));
        let rendered = cache.render_recent(1);
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].ends_with("MESSAGE: \nhello"));
    }
}

//! 入队限流 - 按 (package, user) 的滑动窗口速率限制
//!
//! 超过速率的入队被静默丢弃（宿主通知 API 的 fire-and-forget 语义），
//! 丢弃计数由管线统计。在线数量配额检查由管线直接比较集合大小完成，
//! 本模块只负责速率窗口。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// 滑动窗口限流器
pub struct RateLimiter {
    /// 窗口时长
    window: Duration,
    /// 窗口内最大入队次数
    max_per_window: usize,
    /// 每个 (package, user) 最近的入队时间
    recent: HashMap<(String, i32), VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_per_window: usize) -> Self {
        Self {
            window,
            max_per_window,
            recent: HashMap::new(),
        }
    }

    /// 检查并记录一次入队，超速时返回 false
    pub fn allow(&mut self, package: &str, user_id: i32) -> bool {
        self.allow_at(package, user_id, Instant::now())
    }

    /// 检查并记录一次入队（带时间戳，用于测试）
    pub fn allow_at(&mut self, package: &str, user_id: i32, now: Instant) -> bool {
        let times = self
            .recent
            .entry((package.to_string(), user_id))
            .or_default();

        // 窗口外的记录滚出
        while let Some(front) = times.front() {
            if now.duration_since(*front) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= self.max_per_window {
            return false;
        }
        times.push_back(now);
        true
    }

    /// 清理空闲发送方的残留状态
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.recent.retain(|_, times| {
            times.retain(|t| now.duration_since(*t) < window);
            !times.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_beyond_max_is_rejected() {
        // 场景 6：快速突发超过阈值后被丢弃
        let mut limiter = RateLimiter::new(Duration::from_secs(1), 3);
        let now = Instant::now();

        assert!(limiter.allow_at("pkg", 0, now));
        assert!(limiter.allow_at("pkg", 0, now));
        assert!(limiter.allow_at("pkg", 0, now));
        assert!(!limiter.allow_at("pkg", 0, now));
        assert!(!limiter.allow_at("pkg", 0, now));
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = RateLimiter::new(Duration::from_millis(100), 2);
        let t0 = Instant::now();

        assert!(limiter.allow_at("pkg", 0, t0));
        assert!(limiter.allow_at("pkg", 0, t0));
        assert!(!limiter.allow_at("pkg", 0, t0));

        // 窗口滑过后恢复
        let t1 = t0 + Duration::from_millis(150);
        assert!(limiter.allow_at("pkg", 0, t1));
    }

    #[test]
    fn test_packages_are_independent() {
        let mut limiter = RateLimiter::new(Duration::from_secs(1), 1);
        let now = Instant::now();

        assert!(limiter.allow_at("a", 0, now));
        assert!(!limiter.allow_at("a", 0, now));
        // 其他包和其他用户不受影响
        assert!(limiter.allow_at("b", 0, now));
        assert!(limiter.allow_at("a", 1, now));
    }

    #[test]
    fn test_cleanup_drops_idle_senders() {
        let mut limiter = RateLimiter::new(Duration::from_millis(10), 2);
        let past = Instant::now() - Duration::from_millis(50);
        limiter.allow_at("pkg", 0, past);

        limiter.cleanup();
        assert!(limiter.recent.is_empty());
    }
}

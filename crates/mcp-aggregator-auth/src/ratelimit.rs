//! Per-IP rate limiting for `/authorize`, `/token`, and `/register`, with
//! standard draft rate-limit headers.

use std::net::IpAddr;
use std::num::NonZeroU32;

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;

pub struct IpRateLimiter {
    limiter: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
    max: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
}

impl IpRateLimiter {
    /// `max` requests per `window_secs` seconds, per source IP.
    pub fn new(max: u32, window_secs: u64) -> Self {
        let per = std::time::Duration::from_secs(window_secs.max(1)) / max.max(1);
        let quota = Quota::with_period(per)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
            .allow_burst(NonZeroU32::new(max.max(1)).unwrap());
        Self {
            limiter: RateLimiter::keyed(quota),
            max,
        }
    }

    /// Honors a configurable trust-proxy hop into the `X-Forwarded-For`
    /// chain; `trust_proxy_hops = 0` means trust the direct peer address
    /// only.
    pub fn resolve_client_ip(
        peer: IpAddr,
        forwarded_for: Option<&str>,
        trust_proxy_hops: usize,
    ) -> IpAddr {
        if trust_proxy_hops == 0 {
            return peer;
        }
        let Some(chain) = forwarded_for else {
            return peer;
        };
        let hops: Vec<&str> = chain.split(',').map(|s| s.trim()).collect();
        let idx = hops.len().saturating_sub(trust_proxy_hops);
        hops.get(idx)
            .and_then(|s| s.parse::<IpAddr>().ok())
            .unwrap_or(peer)
    }

    pub fn check(&self, ip: IpAddr) -> Result<RateLimitHeaders, RateLimitHeaders> {
        match self.limiter.check_key(&ip) {
            Ok(_) => Ok(RateLimitHeaders {
                limit: self.max,
                remaining: self.max.saturating_sub(1),
                reset_seconds: 0,
            }),
            Err(not_until) => {
                let wait = not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                Err(RateLimitHeaders {
                    limit: self.max,
                    remaining: 0,
                    reset_seconds: wait.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_client_ip_from_trusted_hop() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let chain = "1.2.3.4, 10.0.0.2";
        let resolved = IpRateLimiter::resolve_client_ip(peer, Some(chain), 1);
        assert_eq!(resolved.to_string(), "10.0.0.2");
    }

    #[test]
    fn untrusted_proxy_config_uses_direct_peer() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let resolved = IpRateLimiter::resolve_client_ip(peer, Some("1.2.3.4"), 0);
        assert_eq!(resolved, peer);
    }

    #[test]
    fn limiter_rejects_after_burst_exhausted() {
        let limiter = IpRateLimiter::new(2, 60);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_err());
    }
}

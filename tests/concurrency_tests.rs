//! Concurrency and thread-safety tests for the serving primitives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ocrd::{fingerprint, PipelineConfig, RateLimitConfig, RateLimiter};

#[test]
fn fingerprints_are_stable_across_threads() {
    let config = Arc::new(PipelineConfig {
        language: "zh-CN".into(),
        dictionary_paths: vec!["a.txt".into(), "b.txt".into()],
        ..PipelineConfig::default()
    });
    let expected = fingerprint(&config);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let config = Arc::clone(&config);
            thread::spawn(move || fingerprint(&config))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn limiter_minute_cap_holds_under_contention() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        enabled: true,
        requests_per_minute: 8,
        requests_per_hour: 0,
        max_requests_per_day: 0,
        max_data_per_day: 0,
    }));
    let admitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                if limiter.check("tenant", 10).is_ok() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 8);
    let usage = limiter.usage("tenant").unwrap();
    assert_eq!(usage.requests_last_minute, 8);
    assert_eq!(usage.bytes_today, 80);
}

#[test]
fn limiter_quota_never_oversubscribes_bytes() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        enabled: true,
        requests_per_minute: 0,
        requests_per_hour: 0,
        max_requests_per_day: 0,
        max_data_per_day: 1_000,
    }));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                let _ = limiter.check("tenant", 100);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let usage = limiter.usage("tenant").unwrap();
    assert!(usage.bytes_today <= 1_000, "bytes = {}", usage.bytes_today);
    assert_eq!(usage.bytes_today, 1_000);
}

#[test]
fn limiter_snapshot_reads_do_not_block_progress() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        enabled: true,
        requests_per_minute: 0,
        requests_per_hour: 0,
        max_requests_per_day: 0,
        max_data_per_day: 0,
    }));

    let writer = {
        let limiter = Arc::clone(&limiter);
        thread::spawn(move || {
            for _ in 0..500 {
                limiter.check("writer", 1).unwrap();
            }
        })
    };
    let reader = {
        let limiter = Arc::clone(&limiter);
        thread::spawn(move || {
            for _ in 0..500 {
                let _ = limiter.usage("writer");
                let _ = limiter.tracked_clients();
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(limiter.usage("writer").unwrap().requests_today, 500);
}

// The single-flight protocol itself is unit-tested next to the cache;
// this exercises the public fingerprint + limiter pair the way the
// server composes them: many concurrent requests, one slow shared
// resource build, bounded admissions.
#[test]
fn admission_then_single_build_composition() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        enabled: true,
        requests_per_minute: 4,
        requests_per_hour: 0,
        max_requests_per_day: 0,
        max_data_per_day: 0,
    }));
    let built = Arc::new(AtomicUsize::new(0));
    let shared: Arc<std::sync::OnceLock<u64>> = Arc::new(std::sync::OnceLock::new());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let built = Arc::clone(&built);
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                if limiter.check("c", 0).is_err() {
                    return None;
                }
                let value = *shared.get_or_init(|| {
                    built.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    fingerprint(&PipelineConfig::default())
                });
                Some(value)
            })
        })
        .collect();

    let admitted: Vec<u64> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(admitted.len(), 4);
    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(admitted.windows(2).all(|w| w[0] == w[1]));
}

use std::collections::HashSet;
use std::time::Duration;

use super::*;

fn core() -> RedisCore {
    let cfg = RedisStorageConfig {
        key_prefix: "testprefix".to_string(),
        ..RedisStorageConfig::default()
    };
    RedisCore {
        client: redis::Client::open(cfg.url.as_str()).expect("valid url"),
        cfg,
        connection: Mutex::new(None),
    }
}

#[test]
fn keys_are_namespaced_per_chat() {
    let core = core();
    assert_eq!(core.state_key("chat1"), "testprefix:state:chat1");
    assert_eq!(core.history_key("chat1"), "testprefix:history:chat1");
    assert_eq!(core.tools_key("chat1"), "testprefix:tools:chat1");
    assert_eq!(
        core.lock_key("chat_write", "chat1"),
        "testprefix:lock:chat_write:chat1"
    );
}

#[test]
fn lock_scopes_do_not_collide() {
    let core = core();
    let scopes = ["chat_write", "tool_write", "trim", "turn"];
    let keys: HashSet<String> = scopes
        .iter()
        .map(|scope| core.lock_key(scope, "chat1"))
        .collect();
    assert_eq!(keys.len(), scopes.len());
}

#[test]
fn lock_owner_tokens_are_unique() {
    let tokens: HashSet<String> = (0..1000).map(|_| next_lock_owner_token()).collect();
    assert_eq!(tokens.len(), 1000);
}

#[tokio::test]
async fn connection_failures_consume_the_full_retry_budget() {
    // Nothing listens on port 1; every connection open fails.
    let cfg = RedisStorageConfig {
        url: "redis://127.0.0.1:1".to_string(),
        max_retries: 3,
        retry_delay_ms: 30,
        ..RedisStorageConfig::default()
    };
    let core = RedisCore {
        client: redis::Client::open(cfg.url.as_str()).expect("valid url"),
        cfg,
        connection: Mutex::new(None),
    };

    let started = Instant::now();
    let result = core
        .run_command::<Option<String>, _>("unreachable_get", || {
            let mut cmd = redis::cmd("GET");
            cmd.arg("k");
            cmd
        })
        .await;

    assert!(matches!(result, Err(StateError::StorageUnavailable(_))));
    // Backoff sleeps before the second and third attempts: 30ms + 60ms.
    assert!(started.elapsed() >= Duration::from_millis(90));
}

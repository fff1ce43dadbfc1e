//! Lease store: exclusive TTL leases with monotonically increasing tokens.

use std::time::Duration;

use super::ProviderFactory;

pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_lease_is_exclusive(factory).await;
    test_expired_lease_changes_hands(factory).await;
    test_renew_requires_current_holder(factory).await;
    test_release_frees_the_key(factory).await;
    test_holders_on_one_node_are_distinct(factory).await;
    test_concurrent_acquires_have_one_holder(factory).await;
    test_list_leases_skips_expired(factory).await;
}

pub async fn test_lease_is_exclusive<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing leases: exclusivity");
    let provider = factory.create_provider().await;
    let ttl = Duration::from_secs(30);

    let a = provider.acquire_lease("instance/x", "node-a", ttl).await.unwrap().unwrap();
    assert_eq!(a.token, 1);
    assert!(provider.acquire_lease("instance/x", "node-b", ttl).await.unwrap().is_none());

    // Re-acquiring as the holder keeps the token.
    let again = provider.acquire_lease("instance/x", "node-a", ttl).await.unwrap().unwrap();
    assert_eq!(again.token, a.token);

    // Unrelated keys are independent.
    assert!(provider.acquire_lease("instance/y", "node-b", ttl).await.unwrap().is_some());
    tracing::info!("✓ Test passed: exclusivity verified");
}

/// Goal: after expiry another owner gets the key with a larger token, and
/// the previous holder can no longer renew.
pub async fn test_expired_lease_changes_hands<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing leases: expiry and fencing token");
    let provider = factory.create_provider().await;
    let short = Duration::from_millis(100);

    let a = provider.acquire_lease("instance/x", "node-a", short).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let b = provider
        .acquire_lease("instance/x", "node-b", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert!(b.token > a.token);
    assert!(provider.renew_lease(&a, Duration::from_secs(30)).await.unwrap().is_none());
    tracing::info!("✓ Test passed: expired lease taken over");
}

pub async fn test_renew_requires_current_holder<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing leases: renewal");
    let provider = factory.create_provider().await;
    let a = provider
        .acquire_lease("instance/x", "node-a", Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    let renewed = provider
        .renew_lease(&a, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renewed.token, a.token);
    assert!(renewed.expires_at_ms >= a.expires_at_ms);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        provider
            .acquire_lease("instance/x", "node-b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none(),
        "renewed lease must outlive its original ttl"
    );
    tracing::info!("✓ Test passed: renewal verified");
}

pub async fn test_release_frees_the_key<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing leases: release");
    let provider = factory.create_provider().await;
    let ttl = Duration::from_secs(30);
    let a = provider.acquire_lease("instance/x", "node-a", ttl).await.unwrap().unwrap();

    // A stranger's release is ignored.
    let forged = crate::providers::Lease {
        owner: "node-b".to_string(),
        ..a.clone()
    };
    provider.release_lease(&forged).await.unwrap();
    assert!(provider.acquire_lease("instance/x", "node-b", ttl).await.unwrap().is_none());

    provider.release_lease(&a).await.unwrap();
    let b = provider.acquire_lease("instance/x", "node-b", ttl).await.unwrap().unwrap();
    assert!(b.token > a.token);
    tracing::info!("✓ Test passed: release verified");
}

/// Goal: two workers of one node are separate holders. Re-entry is only for
/// the exact holder name, so a release by one worker never lets a third
/// party in alongside the other.
pub async fn test_holders_on_one_node_are_distinct<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing leases: per-worker holders");
    let provider = factory.create_provider().await;
    let ttl = Duration::from_secs(30);
    let key = "wf/ns/x/r";

    let first = provider.acquire_lease(key, "node-1/workflow-0", ttl).await.unwrap().unwrap();
    assert!(provider.acquire_lease(key, "node-1/workflow-1", ttl).await.unwrap().is_none());
    assert!(provider.acquire_lease(key, "node-1", ttl).await.unwrap().is_none());

    provider.release_lease(&first).await.unwrap();
    let next = provider.acquire_lease(key, "node-2/workflow-0", ttl).await.unwrap().unwrap();
    assert!(next.token > first.token);
    assert!(provider.acquire_lease(key, "node-1/workflow-1", ttl).await.unwrap().is_none());
    assert!(provider.renew_lease(&first, ttl).await.unwrap().is_none());
    tracing::info!("✓ Test passed: per-worker holders verified");
}

pub async fn test_concurrent_acquires_have_one_holder<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing leases: concurrent acquire");
    let provider = factory.create_provider().await;
    let mut handles = Vec::new();
    for n in 0..8 {
        let p = provider.clone();
        handles.push(tokio::spawn(async move {
            p.acquire_lease("instance/race", &format!("node-{n}"), Duration::from_secs(30)).await
        }));
    }
    let mut holders = Vec::new();
    for h in handles {
        if let Some(lease) = h.await.unwrap().expect("acquire must not fail under contention") {
            holders.push(lease);
        }
    }
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].token, 1);
    tracing::info!("✓ Test passed: one holder under contention");
}

pub async fn test_list_leases_skips_expired<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing leases: listing");
    let provider = factory.create_provider().await;
    provider
        .acquire_lease("node/a", "a", Duration::from_secs(30))
        .await
        .unwrap();
    provider
        .acquire_lease("node/b", "b", Duration::from_millis(50))
        .await
        .unwrap();
    provider
        .acquire_lease("instance/x", "a", Duration::from_secs(30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let live = provider.list_leases("node/").await.unwrap();
    let keys: Vec<&str> = live.iter().map(|l| l.key.as_str()).collect();
    assert_eq!(keys, vec!["node/a"]);
    tracing::info!("✓ Test passed: listing verified");
}

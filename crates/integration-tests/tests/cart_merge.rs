//! Identity transition tests: login merge, logout, session restore.

use std::sync::Arc;
use std::time::Duration;

use naked_pineapple_cart::persistence::{FileLocalStore, LocalStore, RemoteOp};
use naked_pineapple_cart::{CartContext, CartError, TransitionOutcome};
use naked_pineapple_core::IdentityContext;
use naked_pineapple_integration_tests::{CUSTOMER, TestCart, expected, line, usd};

fn customer() -> IdentityContext {
    IdentityContext::authenticated(CUSTOMER)
}

// ============================================================================
// Login
// ============================================================================

#[tokio::test]
async fn test_merge_into_empty_remote() {
    let t = TestCart::new();
    t.cart.add_item(line("V1", 2)).await.expect("add");

    let outcome = t.cart.transition(customer()).await.expect("login");

    assert!(matches!(outcome, TransitionOutcome::Merged { merged_lines: 1 }));
    assert_eq!(t.remote_quantities(), expected(&[("V1", 2)]));
    assert_eq!(t.quantities(), expected(&[("V1", 2)]));
    assert!(t.local.is_empty());
    assert!(t.cart.lines()[0].line_id().is_some());
}

#[tokio::test]
async fn test_merge_sums_existing_remote_line() {
    let t = TestCart::new();
    t.seed_remote(&[("V1", 3)]);
    t.cart.add_item(line("V1", 2)).await.expect("add");

    t.cart.transition(customer()).await.expect("login");

    assert_eq!(t.remote_quantities(), expected(&[("V1", 5)]));
    assert_eq!(t.quantities(), expected(&[("V1", 5)]));
    assert_eq!(t.remote.call_count(RemoteOp::Sync), 1);
}

#[tokio::test]
async fn test_merge_takes_price_from_server() {
    let t = TestCart::new();
    t.cart.add_item(line("V1", 1)).await.expect("add");
    assert_eq!(t.cart.total_price(), usd(100));

    t.cart.transition(customer()).await.expect("login");

    assert_eq!(t.cart.lines()[0].unit_price(), usd(2000));
    assert_eq!(t.cart.total_price(), usd(2000));
}

#[tokio::test]
async fn test_merge_from_snapshot_of_earlier_session() {
    let t = TestCart::new();
    t.local
        .save(&[line("V1", 2), line("V3", 1)])
        .await
        .expect("snapshot");

    let outcome = t.cart.transition(customer()).await.expect("login");

    assert!(matches!(outcome, TransitionOutcome::Merged { merged_lines: 2 }));
    assert_eq!(t.remote_quantities(), expected(&[("V1", 2), ("V3", 1)]));
}

#[tokio::test]
async fn test_empty_guest_cart_leaves_remote_unchanged() {
    let t = TestCart::new();
    t.seed_remote(&[("V1", 3), ("V2", 1)]);

    let outcome = t.cart.transition(customer()).await.expect("login");

    assert!(matches!(outcome, TransitionOutcome::Fetched { lines: 2 }));
    assert_eq!(t.remote_quantities(), expected(&[("V1", 3), ("V2", 1)]));
    assert_eq!(t.quantities(), expected(&[("V1", 3), ("V2", 1)]));
    assert_eq!(t.remote.call_count(RemoteOp::Sync), 0);
}

#[tokio::test]
async fn test_failed_merge_keeps_guest_cart() {
    let t = TestCart::new();
    t.cart.add_item(line("V1", 2)).await.expect("add");
    t.remote.fail_next(RemoteOp::Sync);

    let err = t.cart.transition(customer()).await.expect_err("merge must fail");

    assert!(matches!(err, CartError::Network(_)));
    assert_eq!(t.cart.identity(), IdentityContext::Guest);
    assert_eq!(t.quantities(), expected(&[("V1", 2)]));
    assert_eq!(t.local_quantities().await, expected(&[("V1", 2)]));
    assert!(t.remote_quantities().is_empty());

    // Retry succeeds
    t.cart.transition(customer()).await.expect("retry");
    assert_eq!(t.remote_quantities(), expected(&[("V1", 2)]));
    assert!(t.local.is_empty());
}

#[tokio::test]
async fn test_merge_timeout_keeps_guest_cart() {
    let t = TestCart::with_timeout(Duration::from_millis(50));
    t.cart.add_item(line("V1", 2)).await.expect("add");
    t.remote.hang_next(RemoteOp::Sync);

    assert!(t.cart.transition(customer()).await.is_err());
    assert!(t.cart.identity().is_guest());
    assert_eq!(t.local_quantities().await, expected(&[("V1", 2)]));
}

#[tokio::test]
async fn test_repeated_login_never_merges_twice() {
    let t = TestCart::new();
    t.cart.add_item(line("V1", 2)).await.expect("add");

    t.cart.transition(customer()).await.expect("login");
    let again = t.cart.transition(customer()).await.expect("login again");

    assert!(matches!(again, TransitionOutcome::Unchanged));
    assert_eq!(t.remote.call_count(RemoteOp::Sync), 1);
    assert_eq!(t.remote_quantities(), expected(&[("V1", 2)]));
}

#[tokio::test]
async fn test_concurrent_logins_merge_once() {
    let t = TestCart::new();
    t.cart.add_item(line("V1", 2)).await.expect("add");

    let (first, second) = tokio::join!(
        t.cart.transition(customer()),
        t.cart.transition(customer())
    );
    first.expect("first login");
    second.expect("second login");

    assert_eq!(t.remote.call_count(RemoteOp::Sync), 1);
    assert_eq!(t.remote_quantities(), expected(&[("V1", 2)]));
}

#[tokio::test]
async fn test_guest_add_during_merge_is_rejected() {
    let t = TestCart::new();
    t.cart.add_item(line("V1", 2)).await.expect("add");
    t.remote.delay_next(RemoteOp::Sync, Duration::from_millis(50));

    let late_add = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.cart.add_item(line("V3", 1)).await
    };
    let (login, added) = tokio::join!(t.cart.transition(customer()), late_add);

    login.expect("login");
    assert!(matches!(added, Err(CartError::Superseded)));
    assert_eq!(t.quantities(), expected(&[("V1", 2)]));
    assert_eq!(t.remote_quantities(), t.quantities());
}

#[tokio::test]
async fn test_guest_add_during_failed_merge_is_kept() {
    let t = TestCart::new();
    t.cart.add_item(line("V1", 2)).await.expect("add");
    t.remote.delay_next(RemoteOp::Sync, Duration::from_millis(50));
    t.remote.fail_next(RemoteOp::Sync);

    let late_add = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.cart.add_item(line("V3", 1)).await
    };
    let (login, added) = tokio::join!(t.cart.transition(customer()), late_add);

    assert!(login.is_err());
    added.expect("add must be kept");
    assert!(t.cart.identity().is_guest());
    assert_eq!(t.quantities(), expected(&[("V1", 2), ("V3", 1)]));
    assert_eq!(t.local_quantities().await, t.quantities());
}

// ============================================================================
// Logout
// ============================================================================

#[tokio::test]
async fn test_logout_clears_everything() {
    let t = TestCart::new();
    t.login().await;
    t.cart.add_item(line("V1", 2)).await.expect("add");

    let outcome = t.cart.transition(IdentityContext::Guest).await.expect("logout");

    assert!(t.cart.lines().is_empty());
    assert!(t.local.is_empty());
    assert!(t.cart.identity().is_guest());

    let TransitionOutcome::LoggedOut {
        remote_clear: Some(handle),
    } = outcome
    else {
        panic!("expected a logout with a remote clear");
    };
    handle.await.expect("remote clear task");
    assert!(t.remote_quantities().is_empty());
}

#[tokio::test]
async fn test_logout_does_not_wait_for_remote() {
    let t = TestCart::with_timeout(Duration::from_millis(100));
    t.login().await;
    t.cart.add_item(line("V1", 2)).await.expect("add");
    t.remote.hang_next(RemoteOp::Clear);

    let outcome = t.cart.transition(IdentityContext::Guest).await.expect("logout");

    assert!(t.cart.lines().is_empty());
    if let TransitionOutcome::LoggedOut {
        remote_clear: Some(handle),
    } = outcome
    {
        // The background clear times out on its own and is only logged
        handle.await.expect("remote clear task");
    }
    assert_eq!(t.remote_quantities(), expected(&[("V1", 2)]));
}

#[tokio::test]
async fn test_guest_after_logout_starts_fresh() {
    let t = TestCart::new();
    t.login().await;
    t.cart.add_item(line("V1", 2)).await.expect("add");
    t.cart.transition(IdentityContext::Guest).await.expect("logout");

    t.cart.add_item(line("V3", 1)).await.expect("guest add");
    assert_eq!(t.quantities(), expected(&[("V3", 1)]));
    assert_eq!(t.local_quantities().await, expected(&[("V3", 1)]));
}

#[tokio::test]
async fn test_switching_users_clears_previous_cart() {
    let t = TestCart::new();
    t.login().await;
    t.cart.add_item(line("V1", 2)).await.expect("add");

    let outcome = t
        .cart
        .transition(IdentityContext::authenticated("customer-7"))
        .await
        .expect("switch");

    assert!(matches!(outcome, TransitionOutcome::Fetched { lines: 0 }));
    assert!(t.cart.lines().is_empty());
    assert_eq!(t.cart.identity(), IdentityContext::authenticated("customer-7"));
}

// ============================================================================
// Session restore
// ============================================================================

#[tokio::test]
async fn test_guest_session_restores_from_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let t = TestCart::new();
    let open = || {
        let store = FileLocalStore::new(dir.path(), "tab-1").expect("store");
        CartContext::new(
            Arc::new(store),
            t.remote.clone(),
            t.catalog.clone(),
            Duration::from_secs(1),
        )
    };

    let first = open();
    first.add_item(line("V1", 2)).await.expect("add");
    first.add_item(line("V2", 1)).await.expect("add");

    let second = open();
    let outcome = second.load(IdentityContext::Guest).await.expect("load");

    assert!(matches!(outcome, TransitionOutcome::LoadedGuest { lines: 2 }));
    assert_eq!(second.item_count(), 3);
}

#[tokio::test]
async fn test_load_authenticated_merges_saved_guest_cart() {
    let t = TestCart::new();
    t.seed_remote(&[("V1", 1)]);
    t.local.save(&[line("V1", 2)]).await.expect("snapshot");

    let outcome = t.cart.load(customer()).await.expect("load");

    assert!(matches!(outcome, TransitionOutcome::Merged { .. }));
    assert_eq!(t.quantities(), expected(&[("V1", 3)]));
    assert!(t.local.is_empty());
}

#[tokio::test]
async fn test_load_same_user_refreshes_from_server() {
    let t = TestCart::new();
    t.login().await;
    t.seed_remote(&[("V3", 4)]);

    let outcome = t.cart.load(customer()).await.expect("reload");

    assert!(matches!(outcome, TransitionOutcome::Fetched { lines: 1 }));
    assert_eq!(t.quantities(), expected(&[("V3", 4)]));
}

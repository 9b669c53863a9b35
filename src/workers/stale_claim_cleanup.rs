use chrono::{Duration, Utc};

use crate::store::Store;

/// 释放进程崩溃后遗留的 Pending 投递记录，使下次轮询可以重试
pub async fn run(store: &Store, stale_after: Duration) {
    tracing::debug!("stale_claim_cleanup: start");
    let cutoff = Utc::now() - stale_after;
    match store.release_stale_claims(cutoff) {
        Ok(0) => {}
        Ok(count) => tracing::info!(released = count, "stale_claim_cleanup: done"),
        Err(e) => tracing::error!(error = %e, "stale_claim_cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::store::operations::deliveries::ClaimOutcome;
    use crate::store::operations::subscribers::Recipient;

    #[tokio::test]
    async fn releases_only_old_pending_claims() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("claims").to_str().unwrap()).unwrap();
        let alice = Recipient::telegram(1);
        let bob = Recipient::telegram(2);
        let window = Duration::minutes(30);

        let old = Utc::now() - Duration::hours(2);
        assert_eq!(
            store.claim_delivery("2401.00001v1", &alice, old, window).unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store
                .claim_delivery("2401.00001v1", &bob, Utc::now(), window)
                .unwrap(),
            ClaimOutcome::Claimed
        );
        store
            .claim_delivery("2401.00002v1", &alice, old, window)
            .unwrap();
        store
            .confirm_delivery("2401.00002v1", &alice, old)
            .unwrap();

        run(&store, window).await;

        assert!(store.get_delivery("2401.00001v1", &alice).unwrap().is_none());
        assert!(store.get_delivery("2401.00001v1", &bob).unwrap().is_some());
        assert!(store.is_delivered("2401.00002v1", &alice).unwrap());
    }
}

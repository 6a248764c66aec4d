/// Named error conditions of the store.  These travel inside `anyhow::Error` like everything else
/// and are recognized with `is_store_error`, or `downcast_ref::<StoreError>()`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A record's timestamp is missing, unparseable, or outside the window accepted for appends.
    #[error("Bad timestamp")]
    BadTimestamp,

    /// The store has been closed, or is being closed.
    #[error("Cluster store is closed")]
    ClusterClosed,

    /// An append was attempted on a store opened read-only.
    #[error("Cluster store is read-only")]
    ReadOnlyDir,

    /// A persistent store is already open on the same directory in this process.
    #[error("Cluster store is already open for appending")]
    AlreadyOpen,

    /// A read was cancelled; the partial result is still returned.
    #[error("Operation cancelled")]
    Cancelled,
}

pub fn is_store_error(e: &anyhow::Error, which: StoreError) -> bool {
    e.downcast_ref::<StoreError>() == Some(&which)
}

#[test]
fn test_identity() {
    let e: anyhow::Error = StoreError::BadTimestamp.into();
    assert!(is_store_error(&e, StoreError::BadTimestamp));
    assert!(!is_store_error(&e, StoreError::ClusterClosed));
    let e = e.context("appending to ml1");
    assert!(is_store_error(&e, StoreError::BadTimestamp));
    assert!(!is_store_error(&anyhow::anyhow!("Bad timestamp"), StoreError::BadTimestamp));
}

use std::sync::Arc;

/// Cause of a cancellation.
///
/// Every operation on a canceled [`MutexGroup`](super::group::MutexGroup) returns
/// the same cause, so the error is cheap to clone and compares equal to the value
/// originally recorded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The group was canceled by [`MutexGroup::cancel`](super::group::MutexGroup::cancel).
    #[error("mutex group canceled")]
    GroupCanceled,
    /// A [`CancelToken`](super::cancel::CancelToken) was canceled explicitly.
    #[error("canceled")]
    Canceled,
    /// A [`CancelToken`](super::cancel::CancelToken) deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(err))
    }
}

// Other causes are equal only to clones of themselves
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::GroupCanceled, Self::GroupCanceled)
            | (Self::Canceled, Self::Canceled)
            | (Self::DeadlineExceeded, Self::DeadlineExceeded) => true,
            (Self::Other(a), Self::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Error {}

#[cfg(test)]
mod tests {
    use crate::sync::error::Error;
    use std::io;

    #[test]
    fn other_compares_by_identity() {
        let e1 = Error::other(io::Error::other("error1"));
        let e2 = Error::other(io::Error::other("error1"));
        assert_eq!(e1, e1.clone());
        assert_ne!(e1, e2);
        assert_ne!(e1, Error::Canceled);
        assert_eq!(e1.to_string(), "error1");
    }

    #[test]
    fn messages() {
        assert_eq!(Error::GroupCanceled.to_string(), "mutex group canceled");
        assert_eq!(Error::Canceled.to_string(), "canceled");
        assert_eq!(Error::DeadlineExceeded.to_string(), "deadline exceeded");
        assert_ne!(Error::GroupCanceled, Error::Canceled);
    }
}

use crate::error::Error;

/// Four-state status of a query or mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadingState<T> {
    #[default]
    Idle,
    Loading,
    Success(T),
    Error(Error),
}

impl<T> LoadingState<T> {
    pub fn is_idle(&self) -> bool {
        matches!(self, LoadingState::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, LoadingState::Loading)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LoadingState::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LoadingState::Error(_))
    }

    /// `true` for `Success` and `Error`.
    pub fn is_settled(&self) -> bool {
        match self {
            LoadingState::Success(_) | LoadingState::Error(_) => true,
            LoadingState::Idle | LoadingState::Loading => false,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            LoadingState::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            LoadingState::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> LoadingState<&T> {
        match self {
            LoadingState::Idle => LoadingState::Idle,
            LoadingState::Loading => LoadingState::Loading,
            LoadingState::Success(v) => LoadingState::Success(v),
            LoadingState::Error(e) => LoadingState::Error(e.clone()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LoadingState<U> {
        match self {
            LoadingState::Idle => LoadingState::Idle,
            LoadingState::Loading => LoadingState::Loading,
            LoadingState::Success(v) => LoadingState::Success(f(v)),
            LoadingState::Error(e) => LoadingState::Error(e),
        }
    }

    /// Converts a settled state into a `Result`; `None` while idle or loading.
    pub fn into_result(self) -> Option<Result<T, Error>> {
        match self {
            LoadingState::Success(v) => Some(Ok(v)),
            LoadingState::Error(e) => Some(Err(e)),
            LoadingState::Idle | LoadingState::Loading => None,
        }
    }
}

impl<T> From<Result<T, Error>> for LoadingState<T> {
    fn from(value: Result<T, Error>) -> Self {
        match value {
            Ok(v) => LoadingState::Success(v),
            Err(e) => LoadingState::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        let state = LoadingState::<u32>::default();
        assert!(state.is_idle());
        assert!(!state.is_settled());
        assert!(state.into_result().is_none());
    }

    #[test]
    fn test_map_keeps_error_reason() {
        let state: LoadingState<u32> = Err(Error::failed("timeout")).into();
        let mapped = state.map(|v| v * 2);
        assert_eq!(mapped.error(), Some(&Error::OperationFailed("timeout".into())));
        assert_eq!(mapped.error().map(ToString::to_string).as_deref(), Some("timeout"));

        let ok: LoadingState<u32> = Ok(21).into();
        assert_eq!(ok.map(|v| v * 2).value(), Some(&42));
    }

    #[test]
    fn test_cancelled_is_distinguishable() {
        let state = LoadingState::<()>::Error(Error::OperationCancelled);
        assert!(state.error().is_some_and(Error::is_cancelled));
        assert!(!Error::failed("boom").is_cancelled());
    }
}

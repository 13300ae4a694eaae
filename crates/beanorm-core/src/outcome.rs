//! Helpers for early return on non-`Ok` outcomes.

/// Unwrap an `Outcome::Ok`, returning any other outcome from the enclosing
/// function unchanged.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result`, returning `Outcome::Err` from the enclosing function on error.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}

/// Return `Outcome::Cancelled` if the context has been cancelled.
#[macro_export]
macro_rules! check_cancelled {
    ($cx:expr) => {
        if let Some(reason) = $cx.cancel_reason() {
            return $crate::Outcome::Cancelled(reason);
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::{Error, Outcome};

    fn doubled(input: Outcome<i32, Error>) -> Outcome<i32, Error> {
        let v = try_outcome!(input);
        Outcome::Ok(v * 2)
    }

    fn parsed(input: &str) -> Outcome<i64, Error> {
        let v: i64 = try_result!(input.parse::<i64>().map_err(|e| Error::Custom(e.to_string())));
        Outcome::Ok(v)
    }

    #[test]
    fn test_try_outcome_passes_through() {
        assert!(matches!(doubled(Outcome::Ok(2)), Outcome::Ok(4)));
        assert!(matches!(
            doubled(Outcome::Err(Error::Timeout)),
            Outcome::Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_try_result() {
        assert!(matches!(parsed("12"), Outcome::Ok(12)));
        assert!(matches!(parsed("x"), Outcome::Err(Error::Custom(_))));
    }
}

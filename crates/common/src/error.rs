//! Message-carrying errors and the `.context()` extension each crate derives
//! for its own error type.

use std::fmt::Display;

/// An error type with a free-form message variant.
///
/// Implement this for a crate's error type, then invoke [`impl_context!`]
/// next to it to get `.context()` and `.with_context()` on `Result` and
/// `Option` values.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;

    /// `"{context}: {source}"`.
    fn wrap(context: impl Into<String>, source: impl Display) -> Self {
        Self::from_message(format!("{}: {source}", context.into()))
    }
}

/// Define a crate-local `Context` trait for an error type implementing
/// [`FromMessage`]. Without an argument the type is the `Error` in scope.
///
/// ```ignore
/// // crates/flows/src/error.rs
/// parley_common::impl_context!();
///
/// // crates/flows/src/config.rs
/// let config = toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        $crate::impl_context!(Error);
    };
    ($error:ty) => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> ::std::result::Result<T, $error>;

            fn with_context<C: Into<String>>(
                self,
                f: impl FnOnce() -> C,
            ) -> ::std::result::Result<T, $error>;
        }

        impl<T, E: ::std::fmt::Display> Context<T> for ::std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> ::std::result::Result<T, $error> {
                self.map_err(|source| <$error as $crate::FromMessage>::wrap(context, source))
            }

            fn with_context<C: Into<String>>(
                self,
                f: impl FnOnce() -> C,
            ) -> ::std::result::Result<T, $error> {
                self.map_err(|source| <$error as $crate::FromMessage>::wrap(f(), source))
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> ::std::result::Result<T, $error> {
                self.ok_or_else(|| <$error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C: Into<String>>(
                self,
                f: impl FnOnce() -> C,
            ) -> ::std::result::Result<T, $error> {
                self.ok_or_else(|| <$error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    mod parse {
        use crate::FromMessage;

        #[derive(Debug, PartialEq, Eq)]
        pub struct ParseFailure(pub String);

        impl FromMessage for ParseFailure {
            fn from_message(message: String) -> Self {
                Self(message)
            }
        }

        crate::impl_context!(ParseFailure);

        pub fn port(raw: &str) -> Result<u16, ParseFailure> {
            raw.trim()
                .parse::<u16>()
                .with_context(|| format!("port {raw:?}"))
        }

        pub fn first_word(raw: &str) -> Result<&str, ParseFailure> {
            raw.split_whitespace().next().context("empty input")
        }
    }

    #[test]
    fn result_context_prefixes_source() {
        assert_eq!(parse::port(" 8080 "), Ok(8080));
        let err = parse::port("http").unwrap_err();
        assert!(err.0.starts_with("port \"http\": "), "{}", err.0);
    }

    #[test]
    fn option_context_is_the_message() {
        assert_eq!(parse::first_word("hi there"), Ok("hi"));
        assert_eq!(
            parse::first_word("   ").unwrap_err(),
            parse::ParseFailure("empty input".into())
        );
    }
}

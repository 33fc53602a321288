use faststr::FastStr;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One atomic component of a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Str(FastStr),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Str(s) => write!(f, "{:?}", s.as_str()),
        }
    }
}

impl From<&'static str> for KeyPart {
    fn from(value: &'static str) -> Self {
        KeyPart::Str(FastStr::from_static_str(value))
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value.into())
    }
}

impl From<FastStr> for KeyPart {
    fn from(value: FastStr) -> Self {
        KeyPart::Str(value)
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

macro_rules! int_key_part {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeyPart {
                fn from(value: $ty) -> Self {
                    KeyPart::Int(value as i64)
                }
            }
        )*
    };
}

int_key_part!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! wide_key_part {
    ($($ty:ty),*) => {
        $(
            /// Values beyond `i64::MAX` keep their decimal text instead of wrapping.
            impl From<$ty> for KeyPart {
                fn from(value: $ty) -> Self {
                    match i64::try_from(value) {
                        Ok(int) => KeyPart::Int(int),
                        Err(_) => KeyPart::Str(value.to_string().into()),
                    }
                }
            }
        )*
    };
}

wide_key_part!(u64, usize, isize);

/// Ordered composite identifier used for exact cache lookups and for
/// prefix-based invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Vec<KeyPart>);

impl Key {
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The empty key. Every key matches it.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new key with `part` appended.
    pub fn child(&self, part: impl Into<KeyPart>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }

    /// `true` when `pattern` is a prefix of `self`.
    ///
    /// Matching is asymmetric: `["recipe", 42]` matches `["recipe"]`, never the
    /// other way round.
    pub fn matches(&self, pattern: &Key) -> bool {
        self.0.len() >= pattern.0.len() && self.0[..pattern.0.len()] == pattern.0[..]
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str("]")
    }
}

impl<P: Into<KeyPart>> FromIterator<P> for Key {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Key::new(iter)
    }
}

impl From<Vec<KeyPart>> for Key {
    fn from(value: Vec<KeyPart>) -> Self {
        Self(value)
    }
}

/// Builds a [`Key`] from heterogeneous components.
///
/// ```
/// use common::key;
/// let k = key!["recipe", 42];
/// assert_eq!(k.to_string(), r#"["recipe", 42]"#);
/// ```
#[macro_export]
macro_rules! key {
    () => {
        $crate::Key::root()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::Key::from(vec![$($crate::KeyPart::from($part)),+])
    };
}

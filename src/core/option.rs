//! Flexible-arity config wrappers: a field can be omitted, given once, or
//! given as a list, and still deserialize into the same Rust type.
//!
//! Grounded on the path-dependency crate's own `utils::option` module; kept
//! narrower here (no custom iterator states) since the provider config only
//! ever needs construction and iteration, not the full `Vec`-like API.

use serde::{Deserialize, Serialize};

/// Zero-or-one occurrences of `T`. Distinguishes "key absent" from
/// "key present but empty" at the type level via `Unspecified`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoneOrOne<T> {
    #[serde(skip_deserializing)]
    Unspecified,
    None,
    One(T),
}

impl<T> Default for NoneOrOne<T> {
    fn default() -> Self {
        NoneOrOne::Unspecified
    }
}

impl<T> NoneOrOne<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            NoneOrOne::Unspecified | NoneOrOne::None => None,
            NoneOrOne::One(v) => Some(v),
        }
    }

    pub fn as_ref(&self) -> Option<&T> {
        match self {
            NoneOrOne::Unspecified | NoneOrOne::None => None,
            NoneOrOne::One(v) => Some(v),
        }
    }
}

/// Zero, one, or many occurrences of `T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoneOrSome<T> {
    #[serde(skip_deserializing)]
    Unspecified,
    None,
    One(T),
    Some(Vec<T>),
}

impl<T> Default for NoneOrSome<T> {
    fn default() -> Self {
        NoneOrSome::Unspecified
    }
}

impl<T> NoneOrSome<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, NoneOrSome::Unspecified | NoneOrSome::None)
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            NoneOrSome::Unspecified | NoneOrSome::None => Vec::new(),
            NoneOrSome::One(v) => vec![v],
            NoneOrSome::Some(v) => v,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        match self {
            NoneOrSome::Unspecified | NoneOrSome::None => NoneOrSomeIter::Empty,
            NoneOrSome::One(v) => NoneOrSomeIter::One(std::iter::once(v)),
            NoneOrSome::Some(v) => NoneOrSomeIter::Some(v.iter()),
        }
    }
}

enum NoneOrSomeIter<'a, T> {
    Empty,
    One(std::iter::Once<&'a T>),
    Some(std::slice::Iter<'a, T>),
}

impl<'a, T> Iterator for NoneOrSomeIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        match self {
            NoneOrSomeIter::Empty => None,
            NoneOrSomeIter::One(it) => it.next(),
            NoneOrSomeIter::Some(it) => it.next(),
        }
    }
}

/// One-or-many occurrences of `T`; unlike `NoneOrSome` this can never be empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrSome<T> {
    One(T),
    Some(Vec<T>),
}

impl<T> OneOrSome<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrSome::One(v) => vec![v],
            OneOrSome::Some(v) => v,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        match self {
            OneOrSome::One(v) => std::slice::from_ref(v).iter(),
            OneOrSome::Some(v) => v.iter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_or_some_collapses_scalar_and_list_forms() {
        let scalar: NoneOrSome<String> = serde_json::from_str("\"a\"").unwrap();
        let list: NoneOrSome<String> = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(scalar.into_vec(), vec!["a".to_string()]);
        assert_eq!(list.into_vec(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn none_or_some_absent_is_empty() {
        let v: NoneOrSome<String> = NoneOrSome::default();
        assert!(v.is_empty());
        assert!(v.into_vec().is_empty());
    }

    #[test]
    fn one_or_some_iterates_scalar_as_single_item() {
        let v: OneOrSome<i32> = OneOrSome::One(7);
        assert_eq!(v.iter().copied().collect::<Vec<_>>(), vec![7]);
    }
}

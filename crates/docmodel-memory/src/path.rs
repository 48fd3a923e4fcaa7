//! Dotted-path access into stored documents.

use bson::{Bson, Document};
use docmodel_core::{DriverErrorKind, Error, Result};

/// Value at a dotted path. Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set the value at a dotted path, creating intermediate documents.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let slot = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            set_in(slot, rest, value, path)
        }
    }
}

fn set_in(slot: &mut Bson, rest: &str, value: Bson, full: &str) -> Result<()> {
    match slot {
        Bson::Document(inner) => set_path(inner, rest, value),
        Bson::Array(items) => {
            let (head, tail) = match rest.split_once('.') {
                Some((h, t)) => (h, Some(t)),
                None => (rest, None),
            };
            let index: usize = head.parse().map_err(|_| not_traversable(full))?;
            while items.len() <= index {
                items.push(Bson::Null);
            }
            match tail {
                None => {
                    items[index] = value;
                    Ok(())
                }
                Some(tail) => {
                    if matches!(items[index], Bson::Null) {
                        items[index] = Bson::Document(Document::new());
                    }
                    set_in(&mut items[index], tail, value, full)
                }
            }
        }
        Bson::Null => {
            *slot = Bson::Document(Document::new());
            set_in(slot, rest, value, full)
        }
        _ => Err(not_traversable(full)),
    }
}

/// Remove the value at a dotted path, returning it.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head)? {
            Bson::Document(inner) => remove_path(inner, rest),
            _ => None,
        },
    }
}

fn not_traversable(path: &str) -> Error {
    Error::driver(
        DriverErrorKind::Command,
        format!("cannot create field along path '{path}'"),
    )
}

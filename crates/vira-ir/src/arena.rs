//! Append-only storage for the buffers and events of a function.
//!
//! Statements refer to buffers and events through [`Handle`]s. A handle is a
//! bare `u32` index, also in JSON, so a module read from disk can carry
//! handles that point nowhere; `validate` catches those before any pass runs.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Typed index into an [`Arena`].
pub struct Handle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

// Manual impls: deriving would require `T: Clone`, `T: Eq` and so on.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Serialize for Handle<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.index.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Handle<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Handle::new)
    }
}

/// Values addressed by [`Handle`]; serialized as a plain JSON array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stores `value` and returns its handle.
    ///
    /// # Panics
    ///
    /// If the arena already holds `u32::MAX` values.
    pub fn append(&mut self, value: T) -> Handle<T> {
        let Ok(index) = u32::try_from(self.items.len()) else {
            panic!("arena holds more than u32::MAX values");
        };
        self.items.push(value);
        Handle::new(index)
    }

    /// The value behind `handle`, or `None` for a dangling handle.
    pub fn try_get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index())
    }

    /// The first value matching `pred`, with its handle.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<(Handle<T>, &T)> {
        self.iter().find(|(_, v)| pred(v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        // `append` keeps every index within u32.
        self.items
            .iter()
            .enumerate()
            .map(|(i, v)| (Handle::new(i as u32), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.items
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (Handle::new(i as u32), v))
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        &self.items[handle.index()]
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        &mut self.items[handle.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressSpace, Buffer, DataType, Event};

    #[test]
    fn handles_follow_append_order() {
        let mut events = Arena::new();
        let a = events.append(Event { name: "dma0".into() });
        let b = events.append(Event { name: "dma1".into() });
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(events[b].name, "dma1");
        assert_eq!(events.len(), 2);
        assert!(a < b);
    }

    #[test]
    fn dangling_handle_is_none() {
        let mut events = Arena::new();
        events.append(Event { name: "dma0".into() });
        assert!(events.try_get(Handle::new(0)).is_some());
        assert!(events.try_get(Handle::new(3)).is_none());
        assert_eq!(format!("{:?}", Handle::<Event>::new(3)), "#3");
    }

    #[test]
    fn find_by_name() {
        let mut buffers = Arena::new();
        buffers.append(Buffer::fixed("a", DataType::F32, &[4], AddressSpace::Global));
        let b = buffers.append(Buffer::fixed("b", DataType::F32, &[4], AddressSpace::Local));
        let (h, buf) = buffers.find(|buf| buf.name == "b").unwrap();
        assert_eq!(h, b);
        assert_eq!(buf.space, AddressSpace::Local);
        assert!(buffers.find(|buf| buf.name == "c").is_none());
    }

    #[test]
    fn json_form_is_plain() {
        let h: Handle<Event> = Handle::new(5);
        assert_eq!(serde_json::to_string(&h).unwrap(), "5");
        let back: Handle<Event> = serde_json::from_str("5").unwrap();
        assert_eq!(back, h);

        let mut arena = Arena::new();
        arena.append(3u32);
        arena.append(1u32);
        let json = serde_json::to_string(&arena).unwrap();
        assert_eq!(json, "[3,1]");
        assert_eq!(serde_json::from_str::<Arena<u32>>(&json).unwrap(), arena);
    }
}

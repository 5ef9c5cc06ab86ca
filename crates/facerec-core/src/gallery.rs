//! Descriptor store: named persons and their reference descriptors.
//!
//! The gallery is built once at startup and only read afterwards, so it is
//! shared by reference (it is `Sync`) with whatever runs the matching loop.

use crate::types::Descriptor;
use std::collections::HashMap;

/// A known person and the descriptors computed from their sample images.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub name: String,
    pub descriptors: Vec<Descriptor>,
}

/// Ordered collection of persons, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    persons: Vec<Person>,
    index: HashMap<String, usize>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `descriptor` to `name`, creating the person on first use.
    pub fn add(&mut self, name: &str, descriptor: Descriptor) {
        let idx = self.person_index(name);
        self.persons[idx].descriptors.push(descriptor);
    }

    /// Register `name` without descriptors. No-op if the person exists.
    pub fn insert_person(&mut self, name: &str) {
        self.person_index(name);
    }

    /// All persons in insertion order.
    pub fn all(&self) -> &[Person] {
        &self.persons
    }

    pub fn get(&self, name: &str) -> Option<&Person> {
        self.index.get(name).map(|&i| &self.persons[i])
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    /// Total number of descriptors across all persons.
    pub fn descriptor_count(&self) -> usize {
        self.persons.iter().map(|p| p.descriptors.len()).sum()
    }

    fn person_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.persons.len();
        self.persons.push(Person {
            name: name.to_string(),
            descriptors: Vec::new(),
        });
        self.index.insert(name.to_string(), idx);
        idx
    }
}

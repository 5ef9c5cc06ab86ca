//! Nearest-person search over a gallery.
//!
//! The matcher never thresholds: it always reports the closest candidate and
//! leaves the accept/reject decision to [`Nearest::classify`].

use crate::gallery::{Gallery, Person};
use crate::types::Descriptor;
use rayon::prelude::*;

/// Distance reported when the gallery holds no descriptors at all.
pub const NO_MATCH_DISTANCE: f64 = f64::MAX;

/// Closest person to a query descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Nearest<'g> {
    /// `None` when no descriptor was compared.
    pub person: Option<&'g Person>,
    /// Minimum Euclidean distance, or [`NO_MATCH_DISTANCE`].
    pub distance: f64,
}

impl<'g> Nearest<'g> {
    fn none() -> Self {
        Self {
            person: None,
            distance: NO_MATCH_DISTANCE,
        }
    }

    /// Accept the candidate when its distance is at most `threshold`.
    pub fn classify(&self, threshold: f64) -> Verdict<'g> {
        match self.person {
            Some(person) if self.distance <= threshold => Verdict::Known {
                person,
                distance: self.distance,
            },
            _ => Verdict::Unknown {
                distance: self.person.map(|_| self.distance),
            },
        }
    }
}

/// Outcome of applying the acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub enum Verdict<'g> {
    Known { person: &'g Person, distance: f64 },
    /// Distance to the rejected nearest candidate, if there was one.
    Unknown { distance: Option<f64> },
}

impl Verdict<'_> {
    pub fn name(&self) -> Option<&str> {
        match self {
            Verdict::Known { person, .. } => Some(person.name.as_str()),
            Verdict::Unknown { .. } => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Verdict::Known { .. })
    }
}

/// Strategy for finding the closest gallery person to a query descriptor.
pub trait Matcher {
    fn nearest<'g>(&self, gallery: &'g Gallery, query: &Descriptor) -> Nearest<'g>;
}

/// Brute-force linear scan: persons in gallery order, then descriptors in
/// list order. The first minimum encountered wins ties.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn nearest<'g>(&self, gallery: &'g Gallery, query: &Descriptor) -> Nearest<'g> {
        let mut best = Nearest::none();

        for person in gallery.all() {
            for descriptor in &person.descriptors {
                let distance = descriptor.distance(query);
                if distance < best.distance {
                    best = Nearest {
                        person: Some(person),
                        distance,
                    };
                }
            }
        }

        best
    }
}

/// Rayon scan over persons. Returns exactly what [`EuclideanMatcher`] returns:
/// equal distances resolve to the person that comes first in gallery order.
pub struct ParallelMatcher;

impl Matcher for ParallelMatcher {
    fn nearest<'g>(&self, gallery: &'g Gallery, query: &Descriptor) -> Nearest<'g> {
        let best = gallery
            .all()
            .par_iter()
            .enumerate()
            .filter_map(|(idx, person)| {
                person_min_distance(person, query).map(|distance| (distance, idx))
            })
            .reduce_with(|a, b| {
                if b.0 < a.0 || (b.0 == a.0 && b.1 < a.1) {
                    b
                } else {
                    a
                }
            });

        match best {
            Some((distance, idx)) => Nearest {
                person: Some(&gallery.all()[idx]),
                distance,
            },
            None => Nearest::none(),
        }
    }
}

fn person_min_distance(person: &Person, query: &Descriptor) -> Option<f64> {
    person
        .descriptors
        .iter()
        .map(|d| d.distance(query))
        .fold(None, |best, d| match best {
            Some(b) if d < b => Some(d),
            None if d < NO_MATCH_DISTANCE => Some(d),
            other => other,
        })
}

/*
 * Copyright (c) 2026 The Contributors to Eclipse OpenSOVD (see CONTRIBUTORS)
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Byte tree over the scripted request patterns.
//!
//! Every request a simulation defines is indexed in a tree of bytes so an
//! incoming payload can be matched without scanning all keys. Each node holds
//! the possible next bytes plus dedicated children for the `XX` placeholder
//! (exactly one byte, any value) and the trailing `*` wildcard (zero or more
//! bytes).
//!
//! For a simulation defining
//!
//! ```text
//! 22 F1 90
//! 36 XX *
//! 31 XX 12
//! 31 01 12
//! ```
//!
//! the tree looks like
//!
//! ```text
//! - 22
//!   - F1
//!     - 90 -> response
//! - 36
//!   - XX
//!     - * -> response
//! - 31
//!   - XX
//!     - 12 -> response
//!   - 01
//!     - 12 -> response
//! ```

use hashbrown::HashMap;
use thiserror::Error;

use ecusim_interfaces::util::strip_separators;

const PLACEHOLDER_TOKEN: &str = "XX";
const WILDCARD_TOKEN: char = '*';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("'{0}' has an odd number of hex digits")]
    OddLength(String),
    #[error("'{0}' is neither a hex byte nor a placeholder")]
    InvalidToken(String),
    #[error("a wildcard entry for this request already exists")]
    DuplicateWildcard,
}

#[derive(Debug)]
struct Node<T> {
    byte_children: HashMap<u8, Box<Node<T>>>,
    placeholder: Option<Box<Node<T>>>,
    wildcard: Option<Box<Node<T>>>,
    response: Option<T>,
    /// Number of `XX` tokens on the path from the root to this node.
    placeholder_count: u32,
    /// Depth of this node, a wildcard counting as one.
    request_length: u32,
    is_wildcard: bool,
}

impl<T> Node<T> {
    fn new(placeholder_count: u32, request_length: u32) -> Self {
        Node {
            byte_children: HashMap::new(),
            placeholder: None,
            wildcard: None,
            response: None,
            placeholder_count,
            request_length,
            is_wildcard: false,
        }
    }

    fn byte_child(&mut self, byte: u8) -> &mut Node<T> {
        let (count, length) = (self.placeholder_count, self.request_length);
        self.byte_children
            .entry(byte)
            .or_insert_with(|| Box::new(Node::new(count, length + 1)))
    }

    fn placeholder_child(&mut self) -> &mut Node<T> {
        let (count, length) = (self.placeholder_count, self.request_length);
        self.placeholder
            .get_or_insert_with(|| Box::new(Node::new(count + 1, length + 1)))
    }

    fn wildcard_child(&mut self) -> Result<&mut Node<T>, PatternError> {
        if self.wildcard.is_some() {
            return Err(PatternError::DuplicateWildcard);
        }
        let mut node = Node::new(self.placeholder_count, self.request_length + 1);
        node.is_wildcard = true;
        Ok(self.wildcard.insert(Box::new(node)))
    }

    /// A wildcard also matches zero bytes: a candidate without a response of
    /// its own may be represented by its immediate wildcard child.
    fn self_or_wildcard_leaf(&self) -> &Node<T> {
        if self.response.is_none() {
            if let Some(wildcard) = &self.wildcard {
                return wildcard;
            }
        }
        self
    }

    /// Strict match priority: no wildcard on the path beats wildcard, fewer
    /// placeholders beats more, and among wildcard matches the longer pattern
    /// wins. Remaining ties keep the incumbent.
    fn rank(&self) -> (bool, u32, u32) {
        (
            self.is_wildcard,
            self.placeholder_count,
            u32::MAX - self.request_length,
        )
    }
}

/// Index of scripted request patterns with resolution of the best match for
/// an incoming payload.
///
/// Built once while the simulation loads and immutable afterwards; lookups
/// take `&self` and are reentrant.
#[derive(Debug)]
pub struct PatternTrie<T> {
    root: Node<T>,
}

impl<T> Default for PatternTrie<T> {
    fn default() -> Self {
        PatternTrie {
            root: Node::new(0, 0),
        }
    }
}

impl<T> PatternTrie<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `pattern` with the attached response `value`.
    ///
    /// The pattern is a separator insensitive hex token string; `XX` matches
    /// one arbitrary byte and a trailing `*` any number of remaining bytes.
    /// Inserting the same non-wildcard pattern twice replaces the response.
    ///
    /// # Errors
    /// [`PatternError`] when a token is neither hex nor `XX`, when an odd
    /// length suffix is not `*`, or when the wildcard entry already exists.
    pub fn insert(&mut self, pattern: &str, value: T) -> Result<(), PatternError> {
        let cleaned = strip_separators(pattern);
        if !cleaned.is_ascii() {
            return Err(PatternError::InvalidToken(cleaned));
        }
        let mut node = &mut self.root;

        let mut offset = 0;
        while offset + 1 < cleaned.len() {
            let token = &cleaned[offset..offset + 2];
            if token.eq_ignore_ascii_case(PLACEHOLDER_TOKEN) {
                node = node.placeholder_child();
            } else {
                let byte = u8::from_str_radix(token, 16)
                    .map_err(|_| PatternError::InvalidToken(token.to_owned()))?;
                node = node.byte_child(byte);
            }
            offset += 2;
        }

        if cleaned.len() % 2 != 0 {
            if cleaned.ends_with(WILDCARD_TOKEN) {
                node = node.wildcard_child()?;
            } else {
                return Err(PatternError::OddLength(cleaned));
            }
        }

        node.response = Some(value);
        Ok(())
    }

    /// Resolve the best matching response for `payload`, `None` when no
    /// indexed pattern matches.
    #[must_use]
    pub fn lookup(&self, payload: &[u8]) -> Option<&T> {
        let mut candidates: Vec<&Node<T>> = vec![&self.root];

        for &byte in payload {
            if candidates.is_empty() {
                break;
            }
            let mut next: Vec<&Node<T>> = Vec::new();
            for node in candidates {
                if node.is_wildcard {
                    // wildcards absorb any further bytes
                    next.push(node);
                    continue;
                }
                if let Some(child) = node.byte_children.get(&byte) {
                    next.push(child);
                }
                if let Some(placeholder) = &node.placeholder {
                    next.push(placeholder);
                }
                if let Some(wildcard) = &node.wildcard {
                    next.push(wildcard);
                }
            }
            candidates = next;
        }

        let mut best: Option<&Node<T>> = None;
        for candidate in candidates {
            let candidate = candidate.self_or_wildcard_leaf();
            if candidate.response.is_none() {
                continue;
            }
            best = match best {
                None => Some(candidate),
                Some(current) if candidate.rank() < current.rank() => Some(candidate),
                Some(current) => Some(current),
            };
        }
        best.and_then(|node| node.response.as_ref())
    }
}

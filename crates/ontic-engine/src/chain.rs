use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transform::AppliedTransformation;

/// The succession of surfaces one identity has worn, oldest first.
///
/// The first surface pushed is the origin. A later surface equal to the
/// origin closes the chain on itself and marks it recursive: the identity
/// has become itself again, and layers alone can no longer say which
/// occurrence a reference meant. A surface repeating anywhere else in the
/// chain is an ordinary reinterpretation and is not flagged. Once set, the
/// recursive flag stays set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityChain {
    links: Vec<String>,
    recursive: bool,
}

impl IdentityChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the chain `key` traced through `history`: the source surface
    /// of the first proposal for `key` is the origin, and every successor
    /// surface of every proposal for `key` extends the chain in order.
    pub fn from_history(history: &[AppliedTransformation], key: &str) -> Self {
        let mut chain = IdentityChain::new();
        for applied in history {
            if applied.proposal.identity_key != key {
                continue;
            }
            if chain.links.is_empty() {
                chain.push(&applied.proposal.from_surface);
            }
            for surface in &applied.proposal.to_surfaces {
                chain.push(surface);
            }
        }
        chain
    }

    /// Appends `surface` to the chain, flagging recursion when it equals
    /// the origin.
    pub fn push(&mut self, surface: impl Into<String>) {
        let surface = surface.into();
        if self.links.first() == Some(&surface) {
            self.recursive = true;
        }
        self.links.push(surface);
    }

    /// Whether any pushed surface has returned to the origin.
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// The surfaces in push order.
    pub fn links(&self) -> &[String] {
        &self.links
    }
}

impl fmt::Display for IdentityChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, link) in self.links.iter().enumerate() {
            if n > 0 {
                f.write_str(" -> ")?;
            }
            f.write_str(link)?;
        }
        if self.recursive {
            f.write_str(" [recursive]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_chain_closing_on_its_origin_is_recursive() {
        let mut chain = IdentityChain::new();
        chain.push("the man");
        chain.push("a voice");
        chain.push("the stranger");
        assert!(!chain.is_recursive());

        chain.push("the man");
        assert!(chain.is_recursive());
        // The closing surface still joins the chain, and the flag holds
        // through later pushes.
        assert_eq!(chain.links().len(), 4);
        chain.push("someone new");
        assert!(chain.is_recursive());
    }

    #[test]
    fn interior_repeats_are_not_recursion() {
        let mut chain = IdentityChain::new();
        chain.push("the man");
        chain.push("a voice");
        chain.push("a voice");
        assert!(!chain.is_recursive());
        assert_eq!(chain.links(), ["the man", "a voice", "a voice"]);
    }

    #[test]
    fn display_joins_links_and_marks_recursion() {
        let mut chain = IdentityChain::new();
        assert_eq!(chain.to_string(), "");
        chain.push("the man");
        chain.push("a voice");
        assert_eq!(chain.to_string(), "the man -> a voice");
        chain.push("the man");
        assert_eq!(chain.to_string(), "the man -> a voice -> the man [recursive]");
    }
}

//! Ordered first-match rule lists.
//!
//! Every multi-branch classification in the crate is a `RuleList`: rules are
//! evaluated top to bottom and the first matching predicate decides the label.
//! Adding a tier means inserting one row, not another nested `if`.

/// A predicate and the label it assigns.
pub struct Rule<I: ?Sized + 'static, L: 'static> {
    pub label: L,
    pub when: fn(&I) -> bool,
}

/// An ordered rule table with a fallback label.
pub struct RuleList<I: ?Sized + 'static, L: 'static> {
    pub rules: &'static [Rule<I, L>],
    pub otherwise: L,
}

impl<I: ?Sized, L: Copy> RuleList<I, L> {
    /// Label of the first matching rule, or the fallback.
    pub fn classify(&self, input: &I) -> L {
        self.rules
            .iter()
            .find(|rule| (rule.when)(input))
            .map(|rule| rule.label)
            .unwrap_or(self.otherwise)
    }

    /// Index of the deciding rule; `None` when the fallback applied.
    pub fn position(&self, input: &I) -> Option<usize> {
        self.rules.iter().position(|rule| (rule.when)(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Size {
        Big,
        Medium,
        Small,
    }

    static SIZES: RuleList<f64, Size> = RuleList {
        rules: &[
            Rule { label: Size::Big, when: |x: &f64| *x > 10.0 },
            // Overlaps the rule above; order decides.
            Rule { label: Size::Medium, when: |x: &f64| *x > 5.0 },
        ],
        otherwise: Size::Small,
    };

    #[test]
    fn test_first_match_wins() {
        assert_eq!(SIZES.classify(&11.0), Size::Big);
        assert_eq!(SIZES.classify(&7.0), Size::Medium);
        assert_eq!(SIZES.classify(&1.0), Size::Small);
        assert_eq!(SIZES.position(&11.0), Some(0));
        assert_eq!(SIZES.position(&1.0), None);
    }

    #[test]
    fn test_boundaries_fall_to_lower_rule() {
        assert_eq!(SIZES.classify(&10.0), Size::Medium);
        assert_eq!(SIZES.classify(&5.0), Size::Small);
    }
}

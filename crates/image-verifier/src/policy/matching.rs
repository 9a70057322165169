use std::cmp::Ordering;

use tracing::warn;

use super::Rule;
use crate::utils::longest_common_prefix;

/// Specificity record for a rule that matched an image. The most specific
/// pattern wins: most path components first, then per-component literal
/// length, then per-component longest common prefix with the image.
#[derive(Debug, Clone)]
pub struct Match {
    pub rule: Rule,
    component_count: usize,
    component_lengths: Vec<usize>,
    prefix_lengths: Vec<usize>,
}

impl Match {
    pub fn new(rule: Rule, image: &str) -> Self {
        let components: Vec<&str> = rule.pattern.split('/').collect();
        let image_components: Vec<&str> = image.split('/').collect();

        let component_lengths = components.iter().map(|c| c.len()).collect();
        let prefix_lengths = components
            .iter()
            .enumerate()
            .map(|(idx, component)| {
                let image_component = image_components.get(idx).copied().unwrap_or_default();
                longest_common_prefix(component, image_component).len()
            })
            .collect();

        Match {
            component_count: components.len(),
            component_lengths,
            prefix_lengths,
            rule,
        }
    }

    /// Compares two matches and returns the more specific one. On a full
    /// tie the callee wins and a warning is emitted.
    pub fn compare(self, other: Match) -> Match {
        match self.component_count.cmp(&other.component_count) {
            Ordering::Greater => return self,
            Ordering::Less => return other,
            Ordering::Equal => {}
        }

        for (mine, theirs) in self
            .component_lengths
            .iter()
            .zip(other.component_lengths.iter())
        {
            match mine.cmp(theirs) {
                Ordering::Greater => return self,
                Ordering::Less => return other,
                Ordering::Equal => {}
            }
        }

        for (mine, theirs) in self.prefix_lengths.iter().zip(other.prefix_lengths.iter()) {
            match mine.cmp(theirs) {
                Ordering::Greater => return self,
                Ordering::Less => return other,
                Ordering::Equal => {}
            }
        }

        warn!(
            first = self.rule.pattern.as_str(),
            second = other.rule.pattern.as_str(),
            "identical rules"
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn rule(pattern: &str) -> Rule {
        Rule {
            pattern: pattern.to_string(),
            ..Default::default()
        }
    }

    #[rstest]
    // more components win
    #[case("*", "docker.io/*/*", "docker.io/library/image", "docker.io/*/*")]
    // equal components: longer literal component wins
    #[case(
        "docker.io/library/*",
        "docker.io/*/image",
        "docker.io/library/image",
        "docker.io/library/*"
    )]
    #[case("*y/image", "*ry/image", "registry/image", "*ry/image")]
    // length tie: longer common prefix with the image wins
    #[case("regis*/image", "*istry/image", "registry/image", "regis*/image")]
    fn picks_more_specific(
        #[case] first: &str,
        #[case] second: &str,
        #[case] image: &str,
        #[case] winner: &str,
    ) {
        let m1 = Match::new(rule(first), image);
        let m2 = Match::new(rule(second), image);
        assert_eq!(m1.compare(m2).rule.pattern, winner);
    }

    #[test]
    fn tie_returns_caller() {
        let m1 = Match::new(rule("*/*"), "docker.io/image");
        let m2 = Match::new(rule("*/*"), "docker.io/image");
        let winner = m1.compare(m2);
        assert_eq!(winner.rule.pattern, "*/*");
    }

    #[test]
    fn pattern_with_more_components_than_image() {
        // must not panic when the pattern is deeper than the image
        let m = Match::new(rule("a/b/c/d"), "a/b");
        assert_eq!(m.component_count, 4);
    }
}

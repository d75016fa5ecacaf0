//! Linking policy: version choice, condition flags and optional dependencies.

use semver::Version;

use super::module::ModuleDependency;

/// Release quality of a version, from its pre-release label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReleaseCategory {
    Dev,
    Ci,
    Alpha,
    Beta,
    Rc,
    Ga,
}

impl ReleaseCategory {
    /// `1.0.0` is GA, `1.0.0-beta.2` is Beta. Unknown labels count as Dev.
    pub fn of(version: &Version) -> Self {
        if version.pre.is_empty() {
            return ReleaseCategory::Ga;
        }
        let label = version.pre.as_str();
        let head = label
            .split(|c: char| c == '.' || c.is_ascii_digit())
            .next()
            .unwrap_or(label)
            .to_ascii_lowercase();
        match head.as_str() {
            "ci" => ReleaseCategory::Ci,
            "alpha" => ReleaseCategory::Alpha,
            "beta" => ReleaseCategory::Beta,
            "rc" => ReleaseCategory::Rc,
            _ => ReleaseCategory::Dev,
        }
    }
}

/// Decisions the linker delegates. Implementations must be free of side
/// effects; the linker may ask the same question more than once.
pub trait Refiner: Send + Sync {
    /// Pick one of `candidates`, which is never empty and already satisfies
    /// the requirement.
    fn choose_version(&self, module: &str, candidates: &[Version]) -> Option<Version> {
        let _ = module;
        default_choice(candidates)
    }

    /// Whether a conditional-compilation name is defined.
    fn is_defined(&self, name: &str) -> bool {
        let _ = name;
        false
    }

    /// Whether an optional dependency is followed.
    fn follow_optional(&self, dep: &ModuleDependency) -> bool {
        dep.desired
    }
}

/// The best release category first, then the highest version.
pub fn default_choice(candidates: &[Version]) -> Option<Version> {
    candidates
        .iter()
        .max_by(|a, b| {
            ReleaseCategory::of(a)
                .cmp(&ReleaseCategory::of(b))
                .then_with(|| a.cmp(b))
        })
        .cloned()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRefiner;

impl Refiner for DefaultRefiner {}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_release_categories() {
        assert_eq!(ReleaseCategory::of(&v("1.0.0")), ReleaseCategory::Ga);
        assert_eq!(ReleaseCategory::of(&v("1.0.0-rc.1")), ReleaseCategory::Rc);
        assert_eq!(ReleaseCategory::of(&v("1.0.0-beta2")), ReleaseCategory::Beta);
        assert_eq!(ReleaseCategory::of(&v("1.0.0-alpha")), ReleaseCategory::Alpha);
        assert_eq!(ReleaseCategory::of(&v("1.0.0-ci.77")), ReleaseCategory::Ci);
        assert_eq!(ReleaseCategory::of(&v("1.0.0-snapshot")), ReleaseCategory::Dev);
        assert!(ReleaseCategory::Dev < ReleaseCategory::Ci);
        assert!(ReleaseCategory::Rc < ReleaseCategory::Ga);
    }

    #[test]
    fn test_default_prefers_ga_then_highest() {
        let candidates = [v("1.0.0"), v("2.0.0-rc.1"), v("1.1.0"), v("1.1.0-beta")];
        assert_eq!(DefaultRefiner.choose_version("m", &candidates), Some(v("1.1.0")));
        let pre = [v("2.0.0-alpha"), v("2.0.0-beta"), v("1.9.0-beta")];
        assert_eq!(DefaultRefiner.choose_version("m", &pre), Some(v("2.0.0-beta")));
        assert_eq!(DefaultRefiner.choose_version("m", &[]), None);
    }

    #[test]
    fn test_default_flags() {
        assert!(!DefaultRefiner.is_defined("debug"));
        assert!(DefaultRefiner.follow_optional(&ModuleDependency::optional("x", true)));
        assert!(!DefaultRefiner.follow_optional(&ModuleDependency::optional("x", false)));
    }
}

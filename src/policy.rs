use chrono::TimeDelta;
use fieldx::fxstruct;
use garde::Validate;

/// How much history a cache keeps and how it builds it up.
///
/// Built once per cache and never mutated afterwards. Every duration must be positive and the item limit non-zero; a
/// [`Cache`](crate::cache::Cache) refuses to be built with a policy that fails [`Validate::validate`].
///
/// ```
/// use chrono::TimeDelta;
/// use events_cache::policy::RetentionPolicy;
/// use garde::Validate;
///
/// let policy = RetentionPolicy::builder()
///     .max_maintain_duration(TimeDelta::hours(1))
///     .max_item_count(1_000)
///     .build()
///     .unwrap();
/// assert_eq!(policy.build_increment(), TimeDelta::minutes(10));
/// assert!(policy.validate().is_ok());
/// ```
#[fxstruct(no_new, builder, get(copy))]
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct RetentionPolicy {
    /// How far back data is kept.
    #[fieldx(default(TimeDelta::hours(4)))]
    #[garde(custom(positive))]
    max_maintain_duration: TimeDelta,

    /// Hard cap on resident items.
    #[fieldx(default(100_000))]
    #[garde(range(min = 1))]
    max_item_count: usize,

    /// Width of a single chunk fetched while hydrating.
    #[fieldx(default(TimeDelta::minutes(10)))]
    #[garde(custom(positive))]
    build_increment: TimeDelta,
}

impl RetentionPolicy {
    /// A policy with all defaults.
    pub fn standard() -> Self {
        Self {
            max_maintain_duration: TimeDelta::hours(4),
            max_item_count:        100_000,
            build_increment:       TimeDelta::minutes(10),
        }
    }
}

fn positive(value: &TimeDelta, _: &()) -> garde::Result {
    if *value > TimeDelta::zero() {
        Ok(())
    }
    else {
        Err(garde::Error::new(format!("{value} is not a positive duration")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let policy = RetentionPolicy::builder().build().unwrap();
        assert_eq!(policy, RetentionPolicy::standard());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let policy = RetentionPolicy::builder()
            .max_maintain_duration(TimeDelta::hours(1))
            .max_item_count(10)
            .build_increment(TimeDelta::minutes(5))
            .build()
            .unwrap();
        assert_eq!(policy.max_maintain_duration(), TimeDelta::hours(1));
        assert_eq!(policy.max_item_count(), 10);
        assert_eq!(policy.build_increment(), TimeDelta::minutes(5));
    }

    #[test]
    fn non_positive_durations_are_invalid() {
        let zero_increment = RetentionPolicy::builder()
            .build_increment(TimeDelta::zero())
            .build()
            .unwrap();
        let report = zero_increment.validate().unwrap_err();
        assert!(report.to_string().contains("build_increment"), "{report}");

        let negative_retention = RetentionPolicy::builder()
            .max_maintain_duration(TimeDelta::hours(-1))
            .build()
            .unwrap();
        assert!(negative_retention.validate().is_err());

        let no_items = RetentionPolicy::builder().max_item_count(0).build().unwrap();
        assert!(no_items.validate().is_err());
    }
}

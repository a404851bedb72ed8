use crate::plan::concurrent::BarrierSelector;
use crate::util::constants::{
    DEFAULT_MAX_CACHE_SIZE, DEFAULT_MIN_CACHE_SIZE, DEFAULT_SATB_FRAGMENT_SIZE,
};
use crate::util::error::InitError;
use std::default::Default;

/// The prefix of environment variables that override option defaults.
pub const ENV_PREFIX: &str = "CONCGC_";

/// Default alloc-to-trace rate: bytes of card cleaning/tracing owed per byte allocated while
/// concurrent marking is running.
pub const DEFAULT_CONCURRENT_LEVEL: usize = 8;
/// Default multiplier applied to the alloc-to-trace rate when the second card cleaning pass starts.
pub const DEFAULT_CARD_CLEAN_PASS2_BOOST: f64 = 2.0;
/// Default number of busy-wait iterations per reader/writer spin lock spin round.
pub const DEFAULT_RW_SPIN_COUNT: usize = 256;

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Collector options. Every option has a validator; an invalid value leaves the
        /// option at its previous value.
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            /// Options with built-in defaults only, ignoring the environment.
            pub fn builtin() -> Self {
                Options {
                    $($name: $default),*
                }
            }

            /// Set an option by its snake_case name. Returns false (and keeps the previous
            /// value) if the name is unknown, or the value cannot be parsed or is invalid.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling process()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("unknown option {}", s);
                        false
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options::builtin();

                // If we have env vars that start with CONCGC_ and match any option (such as CONCGC_THREADS),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(ENV_PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // Number of parallel GC worker threads.
    threads:               usize           [|v: &usize| *v > 0] = num_cpus::get(),
    // Which barrier keeps concurrent marking correct while the mutator runs.
    concurrent_barrier:    BarrierSelector [always_valid] = BarrierSelector::IncrementalUpdate,
    // Scale copy/scan buffer sizes with the adaptive throttle tracker's scaling factor.
    adaptive_scaling:      bool            [always_valid] = true,
    // Number of concurrent card cleaning passes (the second pass re-cleans the whole table).
    // With 1 there is no pass-2 rate boost: cleaning completes after phase 2 and anything
    // dirtied later is left to the stop-the-world cleaning.
    card_cleaning_passes:  usize           [|v: &usize| (1..=2).contains(v)] = 2,
    // Multiplier for the alloc-to-trace rate once the second card cleaning pass starts.
    card_clean_pass2_boost: f64            [|v: &f64| v.is_finite() && *v >= 1.0] = DEFAULT_CARD_CLEAN_PASS2_BOOST,
    // Bytes traced or cleaned per byte allocated during concurrent marking.
    concurrent_level:      usize           [|v: &usize| *v > 0] = DEFAULT_CONCURRENT_LEVEL,
    // Busy-wait iterations between yields in the reader/writer spin lock.
    rw_spin_count:         usize           [|v: &usize| *v > 0] = DEFAULT_RW_SPIN_COUNT,
    // Lower bound for a copy/scan buffer size in bytes.
    min_cache_size:        usize           [|v: &usize| *v > 0] = DEFAULT_MIN_CACHE_SIZE,
    // Upper bound for a copy/scan buffer size in bytes.
    max_cache_size:        usize           [|v: &usize| *v > 0] = DEFAULT_MAX_CACHE_SIZE,
    // Number of references a remembered-set fragment holds before it is handed to the collector.
    satb_fragment_size:    usize           [|v: &usize| *v > 0] = DEFAULT_SATB_FRAGMENT_SIZE,
}

impl Options {
    /// Set an option by its camelCase name, as runtimes usually spell them on their command line
    /// (e.g. `cardCleaningPasses`).
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        let result = self.set_from_str(sr.as_str(), val);

        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }

    /// Like [`Options::set_from_str`], but reports a rejected value as an error.
    pub fn try_set(&mut self, name: &str, val: &str) -> Result<(), InitError> {
        if self.set_from_str(name, val) {
            Ok(())
        } else {
            Err(InitError::InvalidOption {
                name: name.to_string(),
                value: val.to_string(),
            })
        }
    }

    /// Check constraints that span more than one option.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.min_cache_size > self.max_cache_size {
            return Err(InitError::InvalidOption {
                name: "min_cache_size".to_string(),
                value: format!("{} > max_cache_size {}", self.min_cache_size, self.max_cache_size),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.card_cleaning_passes, 2);
            assert_eq!(options.concurrent_barrier, BarrierSelector::IncrementalUpdate);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("CONCGC_THREADS", "3");

                    let options = Options::default();
                    assert_eq!(options.threads, 3);
                },
                || {
                    std::env::remove_var("CONCGC_THREADS");
                },
            )
        })
    }

    #[test]
    fn with_multiple_valid_env_vars() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("CONCGC_CARD_CLEANING_PASSES", "1");
                    std::env::set_var("CONCGC_CONCURRENT_BARRIER", "Satb");

                    let options = Options::default();
                    assert_eq!(options.card_cleaning_passes, 1);
                    assert_eq!(options.concurrent_barrier, BarrierSelector::Satb);
                },
                || {
                    std::env::remove_var("CONCGC_CARD_CLEANING_PASSES");
                    std::env::remove_var("CONCGC_CONCURRENT_BARRIER");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // out of range, so use the default value
                    std::env::set_var("CONCGC_CARD_CLEANING_PASSES", "3");

                    let options = Options::default();
                    assert_eq!(options.card_cleaning_passes, 2);
                },
                || {
                    std::env::remove_var("CONCGC_CARD_CLEANING_PASSES");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_key() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("CONCGC_ABC", "42");

                    let options = Options::default();
                    assert_eq!(options.concurrent_level, DEFAULT_CONCURRENT_LEVEL);
                },
                || {
                    std::env::remove_var("CONCGC_ABC");
                },
            )
        })
    }

    #[test]
    fn camelcase_names() {
        let mut options = Options::builtin();
        assert!(options.set_from_camelcase_str("cardCleanPass2Boost", "4.5"));
        assert_eq!(options.card_clean_pass2_boost, 4.5);
        assert!(!options.set_from_camelcase_str("cardCleanPass2Boost", "0.5"));
        assert_eq!(options.card_clean_pass2_boost, 4.5);
    }

    #[test]
    fn try_set_reports_errors() {
        let mut options = Options::builtin();
        assert!(options.try_set("satb_fragment_size", "64").is_ok());
        assert_eq!(
            options.try_set("satb_fragment_size", "0"),
            Err(InitError::InvalidOption {
                name: "satb_fragment_size".to_string(),
                value: "0".to_string()
            })
        );
        assert!(options.try_set("no_such_option", "1").is_err());
    }

    #[test]
    fn cache_size_bounds() {
        let mut options = Options::builtin();
        assert!(options.validate().is_ok());
        options.min_cache_size = options.max_cache_size + 1;
        assert!(options.validate().is_err());
    }
}

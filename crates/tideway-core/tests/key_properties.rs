//! Property tests for namespaced key construction.
//!
//! Property: for every `(resource, identifier)` pair, two distinct
//! environments never produce the same key string, and distinct identifiers
//! in the same environment never collide either.

use proptest::prelude::*;
use tideway_core::{Environment, KeyBuilder};

fn arb_environment() -> impl Strategy<Value = Environment> {
    prop_oneof![
        Just(Environment::Dev),
        Just(Environment::Staging),
        Just(Environment::Prod),
        Just(Environment::Test),
    ]
}

fn arb_resource() -> impl Strategy<Value = String> {
    "[a-z0-9_.-]{1,16}"
}

fn arb_identifier() -> impl Strategy<Value = String> {
    // Includes separators, percent signs and non-ASCII text on purpose.
    "[a-zA-Z0-9:%./@ é-]{1,24}"
}

proptest! {
    #[test]
    fn distinct_environments_never_collide(
        resource in arb_resource(),
        identifier in arb_identifier(),
        a in arb_environment(),
        b in arb_environment(),
    ) {
        prop_assume!(a != b);
        let left = KeyBuilder::new(a).build(&resource, &identifier).unwrap();
        let right = KeyBuilder::new(b).build(&resource, &identifier).unwrap();
        prop_assert_ne!(left.as_str(), right.as_str());
    }

    #[test]
    fn distinct_identifiers_never_collide(
        resource in arb_resource(),
        first in arb_identifier(),
        second in arb_identifier(),
        env in arb_environment(),
    ) {
        prop_assume!(first != second);
        let keys = KeyBuilder::new(env);
        let left = keys.build(&resource, &first).unwrap();
        let right = keys.build(&resource, &second).unwrap();
        prop_assert_ne!(left.as_str(), right.as_str());
    }

    #[test]
    fn composite_parts_are_not_ambiguous(
        resource in arb_resource(),
        left in arb_identifier(),
        right in arb_identifier(),
        env in arb_environment(),
    ) {
        let keys = KeyBuilder::new(env);
        let joined = format!("{left}:{right}");
        let composite = keys.build_composite(&resource, &[&left, &right]).unwrap();
        let single = keys.build(&resource, &joined).unwrap();
        prop_assert_ne!(composite.as_str(), single.as_str());
    }
}

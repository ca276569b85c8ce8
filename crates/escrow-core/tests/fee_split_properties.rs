//! Property tests for fee splitting and fee-rate parsing.

use escrow_core::{FeeRate, FeeSplit};
use proptest::prelude::*;

proptest! {
    #[test]
    fn split_conserves_amount(amount in 1u64..=u64::MAX, bps in 0u32..10_000) {
        let rate = FeeRate::from_bps(bps).unwrap();
        let split = FeeSplit::compute(amount, rate);
        prop_assert_eq!(split.platform_fee + split.payee_amount, amount);
    }

    #[test]
    fn platform_rounds_up_by_less_than_one_unit(amount in 1u64..1_000_000_000_000, bps in 0u32..10_000) {
        let rate = FeeRate::from_bps(bps).unwrap();
        let split = FeeSplit::compute(amount, rate);
        // exact = amount * bps / 10_000; fee is its ceiling.
        let scaled = u128::from(amount) * u128::from(bps);
        let fee = u128::from(split.platform_fee);
        prop_assert!(fee * 10_000 >= scaled);
        prop_assert!(fee * 10_000 < scaled + 10_000);
    }

    #[test]
    fn fee_never_exceeds_amount(amount in 1u64..=u64::MAX, bps in 0u32..10_000) {
        let split = FeeSplit::compute(amount, FeeRate::from_bps(bps).unwrap());
        prop_assert!(split.platform_fee <= amount);
    }

    #[test]
    fn four_digit_fractions_parse_to_bps(bps in 0u32..10_000) {
        let text = format!("0.{bps:04}");
        prop_assert_eq!(text.parse::<FeeRate>().unwrap().bps(), bps);
    }
}

#[test]
fn odd_cent_example() {
    let split = FeeSplit::compute(101, "0.10".parse().unwrap());
    assert_eq!((split.platform_fee, split.payee_amount), (11, 90));
}

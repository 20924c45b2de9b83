/// risk.rs — Position sizing
///
///   notional = strength × base_notional            (quote currency)
///   quantity = notional / price                    (base asset)
///
/// Strength is already clamped to [0, 1] by `Signal::new`; a zero strength or
/// a non-positive price yields zero quantity, which the tracker treats as a
/// no-op.

pub fn notional_for(strength: f64, base_notional: f64) -> f64 {
    (strength.clamp(0.0, 1.0) * base_notional).max(0.0)
}

pub fn position_size(strength: f64, base_notional: f64, price: f64) -> f64 {
    if price <= 0.0 || !price.is_finite() {
        return 0.0;
    }
    notional_for(strength, base_notional) / price
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_strength_spends_base_notional() {
        assert_eq!(position_size(1.0, 10.0, 2.0), 5.0);
        assert_eq!(position_size(0.5, 10.0, 2.0), 2.5);
    }

    #[test]
    fn degenerate_inputs_size_to_zero() {
        assert_eq!(position_size(1.0, 10.0, 0.0), 0.0);
        assert_eq!(position_size(1.0, 10.0, -1.0), 0.0);
        assert_eq!(position_size(0.0, 10.0, 2.0), 0.0);
        assert_eq!(position_size(1.0, 10.0, f64::NAN), 0.0);
    }
}

use keyshop_db::models::promo::PromoCode;
use keyshop_db::models::store::User;

/// Rounds to whole kopeks, half away from zero.
fn round_half_away(value: f64) -> i64 {
    let rounded = (value.abs() + 0.5).floor() as i64;
    if value < 0.0 {
        -rounded
    } else {
        rounded
    }
}

/// The first-purchase referral discount applies once: the user was referred
/// and has not spent anything yet.
pub fn eligible_for_referral_discount(user: &User) -> bool {
    user.referred_by.is_some() && user.total_spent == 0
}

/// Price after subtracting `discount_percent` percent, always in [0, base].
pub fn referral_price(base: i64, discount_percent: f64) -> i64 {
    if base <= 0 {
        return base.max(0);
    }
    if discount_percent <= 0.0 {
        return base;
    }
    let discount = round_half_away(base as f64 * discount_percent / 100.0);
    (base - discount).clamp(0, base)
}

/// Promo discounts apply after the referral discount: percentage first, then
/// the fixed amount, clamped at zero.
pub fn promo_price(base: i64, promo: &PromoCode) -> i64 {
    let mut price = base;
    if let Some(percent) = promo.discount_percent {
        price -= round_half_away(price as f64 * percent as f64 / 100.0);
    }
    if let Some(amount) = promo.discount_amount {
        price -= amount;
    }
    price.clamp(0, base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(referred_by: Option<i64>, total_spent: i64) -> User {
        User {
            tg_id: 42,
            username: None,
            balance: 0,
            total_spent,
            referred_by,
            created_at: Utc::now(),
        }
    }

    fn promo(percent: Option<i32>, amount: Option<i64>) -> PromoCode {
        PromoCode {
            id: 1,
            code: "WELCOME".to_string(),
            discount_percent: percent,
            discount_amount: amount,
            max_uses: 10,
            used_count: 0,
            expires_at: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ten_percent_off_three_hundred() {
        assert_eq!(referral_price(30_000, 10.0), 27_000);
    }

    #[test]
    fn fractional_percent_rounds_half_away_from_zero() {
        // 7.5% of 299.99 is 22.499..., which rounds to 22.50.
        assert_eq!(referral_price(29_999, 7.5), 29_999 - 2_250);
        // 0.5 kopek discount rounds up to 1 kopek.
        assert_eq!(referral_price(100, 0.5), 99);
    }

    #[test]
    fn discount_never_leaves_the_zero_to_base_range() {
        for base in [0, 1, 99, 100, 29_999, 1_000_000] {
            for percent in [0.0, 0.5, 10.0, 50.0, 99.9, 100.0, 150.0] {
                let price = referral_price(base, percent);
                assert!(price >= 0, "base {base} percent {percent}");
                assert!(price <= base.max(0), "base {base} percent {percent}");
            }
        }
    }

    #[test]
    fn negative_percent_changes_nothing() {
        assert_eq!(referral_price(30_000, -25.0), 30_000);
    }

    #[test]
    fn eligibility_requires_referral_and_zero_spend() {
        assert!(eligible_for_referral_discount(&user(Some(7), 0)));
        assert!(!eligible_for_referral_discount(&user(Some(7), 100)));
        assert!(!eligible_for_referral_discount(&user(None, 0)));
    }

    #[test]
    fn promo_percent_and_amount_stack() {
        // 20% off 300.00 leaves 240.00, minus fixed 40.00 leaves 200.00.
        assert_eq!(promo_price(30_000, &promo(Some(20), Some(4_000))), 20_000);
    }

    #[test]
    fn promo_clamps_at_zero() {
        assert_eq!(promo_price(1_000, &promo(None, Some(5_000))), 0);
    }
}

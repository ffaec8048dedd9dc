use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database identifier.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw identifier.
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a coupon definition.
    CouponId
);

numeric_id!(
    /// Identifier of a marketplace member (the actor in every coordination key).
    MemberId
);

numeric_id!(
    /// Identifier of a promotion event.
    EventId
);

numeric_id!(
    /// Identifier of an order.
    OrderId
);

numeric_id!(
    /// Identifier of a purchasable product option; inventory is tracked per option.
    OptionId
);

numeric_id!(
    /// Identifier of a payment attempt.
    PaymentId
);

numeric_id!(
    /// Identifier of a member coupon (one issuance record).
    IssuanceId
);

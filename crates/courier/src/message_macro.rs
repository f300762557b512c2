//! Macros for reducing message boilerplate.

/// Implement [`Message`](crate::Message) for a type that derives the serde traits.
///
/// The routing name defaults to the type's identifier; pass `=> "name"` to pin
/// an explicit discriminant.
///
/// # Example
///
/// ```ignore
/// use courier_core::{impl_message, Command};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct PlaceOrder {
///     order_id: String,
///     amount: u64,
/// }
///
/// impl_message!(PlaceOrder);
///
/// impl Command for PlaceOrder {
///     type Output = OrderReceipt;
/// }
/// ```
#[macro_export]
macro_rules! impl_message {
    ($ty:ty) => {
        impl $crate::Message for $ty {
            const MESSAGE_TYPE: &'static str = stringify!($ty);
        }
    };
    ($ty:ty => $name:expr) => {
        impl $crate::Message for $ty {
            const MESSAGE_TYPE: &'static str = $name;
        }
    };
}

/// Implement [`Message`](crate::Message) and [`Event`](crate::Event) for one or more types.
///
/// ```ignore
/// impl_event!(OrderSubmitted, OrderAccepted, PaymentReceived);
/// ```
#[macro_export]
macro_rules! impl_event {
    ($($ty:ty),+ $(,)?) => {
        $(
            $crate::impl_message!($ty);
            impl $crate::Event for $ty {}
        )+
    };
}

pub mod event;
pub mod order;
pub mod ticket;
pub mod user;
pub mod voucher;

pub use event::{Event, EventTicketType};
pub use order::{
    IdentityDocumentType, NewOrder, NewOrderLine, Order, OrderLine, OrderLineView, OrderStatus,
    OrderView,
};
pub use ticket::{Seat, TicketOffering};
pub use user::User;
pub use voucher::{DiscountKind, Voucher, VoucherRedemption, VoucherScope};

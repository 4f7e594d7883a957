pub mod error_condition;
pub mod frame;
pub mod message;
pub mod performatives;
pub mod value;

pub use error_condition::{AmqpErrorCondition, conditions};
pub use frame::{Frame, ProtocolId, SaslCode, SaslFrame};
pub use message::{AmqpMessage, MessageBody, MessageProperties};
pub use performatives::{
    Attach, Begin, Close, DeliveryState, Detach, Disposition, End, Flow, Open, Performative,
    ReceiverSettleMode, Role, SenderSettleMode, Transfer,
};
pub use value::{AmqpProperties, AmqpValue};

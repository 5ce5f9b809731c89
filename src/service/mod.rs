// 业务服务层模块
pub mod call_signaling_service;
pub mod conversation_list_service;
pub mod conversation_update_service;
pub mod delivery_service;
pub mod presence_service;

pub use call_signaling_service::{CallOffer, CallSignalingService};
pub use conversation_list_service::{ConversationListPage, ConversationListService};
pub use conversation_update_service::ConversationUpdateService;
pub use delivery_service::{DeliveryService, SendMessageRequest, SendOutcome};
pub use presence_service::PresenceService;

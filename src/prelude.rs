pub use crate::channel::{
    Channel, ChannelIter, ReadOptions, SubscriptionKey, bridge_join, channel, channel_of,
    channel_with, closed_channel, join, siphon, splice,
};
pub use crate::config::ChannelOptions;
pub use crate::error::FlowError;
pub use crate::graph::{
    Edge, EdgeStyle, Emitter, Node, NodeId, NodeState, Propagator, Terminal, identity_node,
};
pub use crate::message::Message;
pub use crate::operators::{
    DriverCmd, DriverExit, bridge_in_order, combine_latest, concat, emit_in_order, last, mapcat,
    partition, partition_all, partition_every, periodically, receive_in_order, reduce,
    reduce_with, reductions, reductions_with, sample_every, take, take_while,
};
pub use crate::pipeline::{Pipeline, StageOutput, run_pipeline};
pub use crate::queue::{
    Consumer, EventQueue, LockQueue, Release, TxQueue, in_transaction, transaction,
    transactional_copy,
};
pub use crate::result::{
    ResultChannel, SendOutcome, SendResult, merge_send_results, timed_result,
};
pub use crate::time::{Context, Timer};
pub use crate::utils::{AsymLock, Label, freeze};

mod event;
mod habit;
mod helpers;
mod sync;
mod todo;
mod weight;

use stride_core::StrideService;

use crate::http::HttpRequester;

pub(crate) type Service = StrideService<HttpRequester>;

pub(crate) use event::{cmd_event_add, cmd_event_delete, cmd_event_list};
pub(crate) use habit::{cmd_habit_add, cmd_habit_check, cmd_habit_delete, cmd_habit_list};
pub(crate) use sync::{
    cmd_logout, cmd_prune, cmd_queue_list, cmd_queue_purge, cmd_queue_retry, cmd_status, cmd_sync,
    cmd_watch,
};
pub(crate) use todo::{cmd_todo_add, cmd_todo_delete, cmd_todo_done, cmd_todo_list};
pub(crate) use weight::{cmd_weight_delete, cmd_weight_history, cmd_weight_log};

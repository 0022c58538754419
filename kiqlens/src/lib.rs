#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enums,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::indexing_slicing,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    unexpected_cfgs
)]
#![allow(clippy::unused_self, clippy::single_match_else, clippy::todo)]

pub mod coerce;

mod broker_version;
mod clock;
mod error;
mod job_payload;
mod json;
mod metrics;
mod process;
mod queue;
mod sorted_set;
mod stats;
mod storage;
mod storage_builder;
mod storage_internal;
mod storage_keys;


pub use crate::broker_version::BrokerVersion;
pub use crate::clock::Clock;
pub use crate::coerce::TimestampFormat;
pub use crate::error::KiqlensError;
pub use crate::job_payload::{ENCRYPTED_ARG, JobPayload};
pub use crate::metrics::{
    Granularity, HISTOGRAM_LABELS, MetricsBucket, MetricsHistogram, MetricsJobDetail,
    MetricsJobTotals, MetricsPeriod, MetricsTopJobs, bucket_label, bucket_time,
};
pub use crate::process::{ActiveJob, BusyData, Capsule, CapsuleMode, Process, parse_identity};
pub use crate::queue::Queue;
pub use crate::sorted_set::{SortedEntry, SortedSet, SortedSetBounds};
pub use crate::stats::{RedisInfo, Stats, StatsHistory};
pub use crate::storage::Storage;
pub use crate::storage_builder::{
    DEFAULT_REDIS_URL, StorageBuilder, StorageBuilderTimeouts, display_redis_url,
};

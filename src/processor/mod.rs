mod parse;
mod service;
mod sink;
mod stream;

pub use parse::{
    enrich, parse_error_line, parse_generic_line, parse_log_timestamp, parse_slowquery_line,
    parser_for, passthrough_entry, ParsedEntry,
};
pub use service::{ProcessError, Processor};
pub use sink::{ForwardSink, HttpSink, Sink, SinkError};
pub use stream::{open_log_stream, PORTION_LINES};

test_r::enable!();

mod common;
mod disconnects;
mod periodic;
mod protocol;
mod search;

//! End-to-end tests driving the engine tick by tick against scripted
//! market data and scripted strategy votes.

mod scenarios;
mod scripted_feed;

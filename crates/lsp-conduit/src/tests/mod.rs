//! Behavioural tests driving connections through scripted peers.

mod support;

mod helpers;

mod full_flow_test;
mod machines_test;

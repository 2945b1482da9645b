mod checkpoint_tests;
mod common;

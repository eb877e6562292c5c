/*
The scenario tests are organized into the same binary in this directory.

1) For speed (no external linking required)
2) For access to internals
3) So we can compile the library crate with cfg(test) - we use that
   for the debug-pipe backend and the allocation fault gate

See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 */

mod common;

mod auth_test;
mod opener_test;

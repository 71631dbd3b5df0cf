// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A gest test binary running the fixture modules. With `--multiprocessing` it also serves as its
//! own worker.

use integration_tests::fixtures::fixture_registry;

fn main() -> color_eyre::Result<()> {
    gest::main(fixture_registry())
}

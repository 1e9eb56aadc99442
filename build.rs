// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 RootGuard

// Build script for the RootGuard security check library
// Ensures proper linking on Android

fn main() {
    // Tell Cargo to link against log on Android
    #[cfg(target_os = "android")]
    {
        println!("cargo:rustc-link-lib=log");
    }
}

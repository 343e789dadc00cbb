// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed picture syntax handed over by the software parser, one structure per coding standard.

pub mod h264;
pub mod h265;

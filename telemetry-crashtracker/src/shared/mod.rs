// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This module holds constants/structures that are shared between the collectors and the reader

pub(crate) mod configuration;
pub mod constants;
pub(crate) mod threading;

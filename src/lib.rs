// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod packet;
pub mod session;
pub mod store;
pub mod template;
pub mod transport;

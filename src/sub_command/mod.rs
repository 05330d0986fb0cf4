// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Subcommand entry points.

pub mod echo_server;

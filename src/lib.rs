/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod acceptor;
pub mod config;
pub mod endpoint;
pub mod logger;
pub mod net;
pub mod poller;
pub mod pollset;
pub mod sendfile;
pub mod tls;
pub mod worker;

pub use crate::config::Settings;
pub use crate::endpoint::{Endpoint, Error, Executor, Handler, SocketState, SocketStatus};
pub use crate::net::Conn;
pub use crate::sendfile::{SendfileData, SendfileStatus};

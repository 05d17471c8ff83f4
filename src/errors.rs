// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod backing_error;
mod cache_error;
mod config_error;
mod protocol_error;
mod updater_error;

pub use backing_error::BackingError;
pub use cache_error::CacheError;
pub use config_error::ConfigError;
pub use protocol_error::ProtocolError;
pub use updater_error::UpdaterError;

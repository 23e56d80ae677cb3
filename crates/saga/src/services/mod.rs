// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! Business use cases protected by the lock kit.
//!
//! | Service | Resource | Guard |
//! |---|---|---|
//! | [`CouponService`] | coupon quota | lock on `coupon:{id}` |
//! | [`StockService`] | product stock | fencing lock on `product:{id}` |
//! | [`PointService`] | point balance | optimistic retry |
//! | [`OrderService`] | order status | optimistic retry |
//! | [`RankingService`] | popularity sorted set | lock on `ranking:products:lock` |

pub mod coupon;
pub mod order;
pub mod points;
pub mod ranking;
pub mod stock;

pub use coupon::CouponService;
pub use order::{NewOrder, OrderService};
pub use points::PointService;
pub use ranking::{RankingService, DEFAULT_RANKING_KEY};
pub use stock::StockService;

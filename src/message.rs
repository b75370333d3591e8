//! Wire types exchanged across the fabric (spec section 3). Fixed
//! layout, identical size on every rank — `PolicyMessage` lives in
//! [`crate::policy`] since it is tightly coupled to [`crate::policy::Policy`].

use serde::{Deserialize, Serialize};

/// One child's contribution to a region's aggregate for one control
/// period. Coalesced by the fabric: a newer message for the same
/// `(child, region_id)` silently replaces an unread older one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleMessage {
    pub region_id: u64,
    pub runtime: f64,
    pub progress: f64,
    pub energy: f64,
    pub frequency: f64,
}

use vmesh_transport::VirtualAddress;

use crate::mmcp::{ConnectConfig, HotspotRequest, HotspotResult, HOTSPOT_UNSUPPORTED};

/// Brings up physical links on request (access points, peer groups).
///
/// The mesh never touches radios itself; a platform layer implements this
/// and hands the resulting streams to [`VirtualNode`](crate::VirtualNode).
#[async_trait::async_trait]
pub trait LinkProvider: Send + Sync + 'static {
    /// A neighbor asked this node to host an access point.
    async fn request_hotspot(
        &self,
        requester: VirtualAddress,
        request: HotspotRequest,
    ) -> HotspotResult;

    /// How neighbors can join this node right now, advertised in
    /// originator messages.
    fn connect_config(&self) -> Option<ConnectConfig> {
        None
    }
}

/// Provider for nodes that cannot host anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLinkProvider;

#[async_trait::async_trait]
impl LinkProvider for NoLinkProvider {
    async fn request_hotspot(&self, requester: VirtualAddress, _: HotspotRequest) -> HotspotResult {
        tracing::debug!("hotspot request from {requester} refused: no link provider");
        HotspotResult::error(HOTSPOT_UNSUPPORTED)
    }
}

//! Process-global dispatch-patch guard.
//!
//! Lives in its own integration binary because the patch is installed
//! once per process: the not-ready path can only be observed before
//! any other test installs it.

use bytes::BytesMut;
use tokio_util::codec::Encoder;

use vidmap_core::protocol::message::{Clientbound, KeepAlive};
use vidmap_core::protocol::{DisplayCodec, registry};
use vidmap_core::VidmapError;

#[test]
fn sending_before_install_fails_then_install_is_idempotent() {
    // Before startup installs the patch, every send path must refuse.
    assert!(matches!(
        registry::global(),
        Err(VidmapError::DispatchNotReady)
    ));

    let mut codec = DisplayCodec;
    let mut buf = BytesMut::new();
    let probe = Clientbound::KeepAlive(KeepAlive { id: 1 });
    assert!(matches!(
        codec.encode(probe.clone(), &mut buf),
        Err(VidmapError::DispatchNotReady)
    ));

    // Install once; the table is patched and reachable.
    let first = registry::install();
    assert!(first.is_patched());
    assert!(registry::global().is_ok());

    // Installing again yields the very same table — no duplicate
    // registration, no double encoding.
    let second = registry::install();
    assert!(std::ptr::eq(first, second));

    buf.clear();
    codec.encode(probe, &mut buf).unwrap();
    let mut expected = BytesMut::new();
    registry::global()
        .unwrap()
        .encode(&Clientbound::KeepAlive(KeepAlive { id: 1 }), &mut expected)
        .unwrap();
    // Frame = varint length prefix + the table encoding.
    assert_eq!(&buf[1..], &expected[..]);
    assert_eq!(buf[0] as usize, expected.len());
}

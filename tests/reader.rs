// Reader connect/transmit/disconnect over a real registry region and simulated cards.
mod common;

use std::path::Path;

use common::{BCAS_ATR, SharedCard, SimOpener, device};
use tunercard::api::{
    CardStatus, Disposition, ErrorKind, Protocol, READER_INFO_SIZE, Reader, ReaderInfo,
    ReaderState, Registry, RegistryOptions, ShareMode, StaticEnumerator, VirtualPacer,
    reader_state,
};

const PATH: &str = "/dev/tuner/px4-0";

struct Rig {
    _dir: tempfile::TempDir,
    registry: Registry,
    opener: SimOpener,
    card: SharedCard,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = open_registry(dir.path(), READER_INFO_SIZE);
    let card = SharedCard::new(&BCAS_ATR);
    let mut opener = SimOpener::default();
    opener.insert(PATH, card.clone());
    Rig {
        _dir: dir,
        registry,
        opener,
        card,
    }
}

fn open_registry(dir: &Path, user_size: usize) -> Registry {
    Registry::open(
        RegistryOptions::new(common::FRIENDLY)
            .with_dir(dir)
            .with_user_size(user_size),
        StaticEnumerator::new(vec![device(PATH)]),
    )
    .expect("registry")
}

fn connect<'r>(
    rig: &'r Rig,
    mode: ShareMode,
) -> Result<Reader<'r, SharedCard, VirtualPacer>, tunercard::api::Error> {
    Reader::connect(&rig.registry, 0, &rig.opener, mode, VirtualPacer::default())
}

fn stored(rig: &Rig) -> ReaderInfo {
    ReaderInfo::decode(&rig.registry.user_data(0).expect("payload")).expect("record")
}

#[test]
fn shared_readers_count_references() {
    let rig = rig();
    let first = connect(&rig, ShareMode::Shared).expect("first");
    let second = connect(&rig, ShareMode::Shared).expect("second");
    assert_eq!(rig.registry.ref_count(0).unwrap(), 2);
    assert_eq!(first.atr().unwrap(), BCAS_ATR.to_vec());

    // The card was powered up once and the state is shared.
    rig.card.with(|model| assert_eq!(model.resets, 1));

    first.disconnect(Disposition::Leave).unwrap();
    second.disconnect(Disposition::Leave).unwrap();
    assert_eq!(rig.registry.ref_count(0).unwrap(), 0);
    assert!(stored(&rig).card.is_initialized());
}

#[test]
fn exclusive_access_is_enforced_both_ways() {
    let rig = rig();
    let shared = connect(&rig, ShareMode::Shared).expect("shared");
    let err = connect(&rig, ShareMode::Exclusive).err().expect("violation");
    assert_eq!(err.kind(), ErrorKind::SharingViolation);
    shared.disconnect(Disposition::Leave).unwrap();

    let exclusive = connect(&rig, ShareMode::Exclusive).expect("exclusive");
    assert!(stored(&rig).exclusive);
    let err = connect(&rig, ShareMode::Shared).err().expect("not shared");
    assert_eq!(err.kind(), ErrorKind::NotShared);
    assert_eq!(err.slot(), Some(0));

    exclusive.disconnect(Disposition::Leave).unwrap();
    assert!(!stored(&rig).exclusive);
    connect(&rig, ShareMode::Shared).expect("shared again");
}

#[test]
fn direct_mode_is_unsupported() {
    let rig = rig();
    let err = connect(&rig, ShareMode::Direct).err().expect("unsupported");
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(rig.registry.ref_count(0).unwrap(), 0);
}

#[test]
fn small_payload_is_a_usage_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = open_registry(dir.path(), 16);
    let opener = SimOpener::default();
    let err = Reader::connect(&registry, 0, &opener, ShareMode::Shared, VirtualPacer::default())
        .err()
        .expect("usage");
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn missing_device_is_device_not_found() {
    let rig = rig();
    let opener = SimOpener::default();
    let err = Reader::connect(&rig.registry, 0, &opener, ShareMode::Shared, VirtualPacer::default())
        .err()
        .expect("missing");
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    assert_eq!(rig.registry.ref_count(0).unwrap(), 0);
}

#[test]
fn readers_continue_one_sequence() {
    let rig = rig();
    let mut first = connect(&rig, ShareMode::Shared).expect("first");
    let mut second = connect(&rig, ShareMode::Shared).expect("second");

    assert_eq!(first.transmit(&[1, 2]).unwrap(), vec![2, 1]);
    assert_eq!(stored(&rig).card.params().t1.seq, 1);
    assert_eq!(second.transmit(&[3, 4]).unwrap(), vec![4, 3]);
    assert_eq!(stored(&rig).card.params().t1.seq, 0);

    // IFSD was negotiated once and the second reader used N(S)=1.
    rig.card.with(|model| assert_eq!(model.sent_pcbs(), vec![0xC1, 0x00, 0x40]));
}

#[test]
fn reset_is_deferred_until_last_reader_leaves() {
    let rig = rig();
    let first = connect(&rig, ShareMode::Shared).expect("first");
    let second = connect(&rig, ShareMode::Shared).expect("second");

    first.disconnect(Disposition::Reset).unwrap();
    let record = stored(&rig);
    assert!(record.reset_pending);
    assert!(record.card.is_initialized());

    second.disconnect(Disposition::Leave).unwrap();
    let record = stored(&rig);
    assert!(!record.reset_pending);
    assert!(!record.card.is_initialized());

    // Next connect powers the card up again.
    connect(&rig, ShareMode::Shared).expect("reconnect");
    rig.card.with(|model| assert_eq!(model.resets, 2));
}

#[test]
fn dropping_a_reader_releases_its_reference() {
    let rig = rig();
    {
        let _reader = connect(&rig, ShareMode::Exclusive).expect("exclusive");
        assert_eq!(rig.registry.ref_count(0).unwrap(), 1);
    }
    assert_eq!(rig.registry.ref_count(0).unwrap(), 0);
    assert!(!stored(&rig).exclusive);
}

#[test]
fn status_tracks_card_presence() {
    let rig = rig();
    let mut reader = connect(&rig, ShareMode::Shared).expect("reader");
    assert_eq!(reader.status().unwrap(), CardStatus::Specific(Protocol::T1));

    rig.card.with(|model| model.present = false);
    assert_eq!(reader.status().unwrap(), CardStatus::Absent);
    assert!(reader.atr().unwrap().is_empty());

    rig.card.with(|model| model.present = true);
    assert_eq!(reader.status().unwrap(), CardStatus::Specific(Protocol::T1));
    rig.card.with(|model| assert_eq!(model.resets, 2));
}

#[test]
fn reader_state_reports_each_condition() {
    let rig = rig();
    let probe = |slot| reader_state(&rig.registry, slot, &rig.opener, VirtualPacer::default());

    assert_eq!(probe(4), ReaderState::Unavailable);
    assert_eq!(
        probe(0),
        ReaderState::Present {
            in_use: false,
            exclusive: false,
            atr: BCAS_ATR.to_vec(),
        }
    );

    let reader = connect(&rig, ShareMode::Exclusive).expect("exclusive");
    assert_eq!(
        probe(0),
        ReaderState::Present {
            in_use: false,
            exclusive: true,
            atr: BCAS_ATR.to_vec(),
        }
    );
    reader.disconnect(Disposition::Leave).unwrap();

    let _shared = connect(&rig, ShareMode::Shared).expect("shared");
    assert!(matches!(probe(0), ReaderState::Present { in_use: true, .. }));

    rig.card.with(|model| model.present = false);
    assert_eq!(probe(0), ReaderState::Empty);

    rig.card.with(|model| {
        model.present = true;
        model.mute = true;
    });
    assert_eq!(probe(0), ReaderState::Mute);
}

#[test]
fn failed_disconnect_still_returns_the_reference() {
    let rig = rig();
    let reader = connect(&rig, ShareMode::Shared).expect("reader");
    assert_eq!(rig.registry.ref_count(0).unwrap(), 1);

    // An ATR length past the limit makes the stored record unreadable.
    let mut payload = rig.registry.user_data(0).expect("payload");
    payload[4] = 65;
    rig.registry.set_user_data(0, &payload).expect("store");

    let err = reader.disconnect(Disposition::Leave).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert_eq!(rig.registry.ref_count(0).unwrap(), 0);
}

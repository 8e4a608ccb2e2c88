//! Client subscription handle and images.
//!
//! A subscription receives zero or more images (one per remote session).
//! Images arrive asynchronously over the driver's event broadcast; the
//! client routes them into the shared subscription state, and `poll`
//! reads committed fragments from each image's log buffer, advancing the
//! subscriber position counter the driver uses for flow control.

use std::sync::{Arc, Mutex};

use cn_concurrent::AtomicCounter;
use cn_logbuffer::term_reader::{self, FragmentHeader};
use cn_logbuffer::{descriptor, MappedRawLog};

/// One remote session's stream as seen by this subscriber.
pub struct Image {
    pub correlation_id: i64,
    pub session_id: i32,
    log: Arc<MappedRawLog>,
    position: AtomicCounter,
    term_length: usize,
    position_bits: u32,
    is_closed: bool,
}

impl Image {
    pub(crate) fn new(
        correlation_id: i64,
        session_id: i32,
        log: Arc<MappedRawLog>,
        position: AtomicCounter,
    ) -> Self {
        let term_length = log.term_length();
        Image {
            correlation_id,
            session_id,
            log,
            position,
            term_length,
            position_bits: descriptor::position_bits_to_shift(term_length),
            is_closed: false,
        }
    }

    pub fn position(&self) -> i64 {
        self.position.get_volatile()
    }

    /// Read up to `fragment_limit` committed fragments, advancing the
    /// subscriber position.
    pub fn poll<F>(&mut self, handler: &mut F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], FragmentHeader),
    {
        if self.is_closed {
            return 0;
        }

        let position = self.position.get();
        let index = descriptor::index_by_position(position, self.position_bits);
        let offset =
            descriptor::compute_term_offset_from_position(position, self.position_bits) as usize;
        let term = self.log.term_buffer(index);

        let outcome = term_reader::read(&term, offset, self.term_length, fragment_limit, handler);
        if outcome.offset != offset {
            self.position
                .set_ordered(position + (outcome.offset - offset) as i64);
        }
        outcome.fragments_read
    }
}

/// Shared state between the client event router and the subscription
/// handle.
pub struct SubscriptionState {
    pub registration_id: i64,
    images: Vec<Image>,
}

impl SubscriptionState {
    pub(crate) fn new(registration_id: i64) -> Self {
        SubscriptionState {
            registration_id,
            images: Vec::new(),
        }
    }

    pub(crate) fn add_image(&mut self, image: Image) {
        // The driver may re-announce an image (untethered rejoin); keep one.
        self.images
            .retain(|existing| existing.correlation_id != image.correlation_id);
        self.images.push(image);
    }

    pub(crate) fn remove_image(&mut self, correlation_id: i64) {
        self.images.retain(|i| i.correlation_id != correlation_id);
    }
}

/// A subscriber's handle on one stream.
pub struct Subscription {
    registration_id: i64,
    state: Arc<Mutex<SubscriptionState>>,
}

impl Subscription {
    pub(crate) fn new(registration_id: i64, state: Arc<Mutex<SubscriptionState>>) -> Self {
        Subscription {
            registration_id,
            state,
        }
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn image_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .images
            .len()
    }

    /// Poll every image for fragments, fairly bounded by `fragment_limit`.
    pub fn poll<F>(&mut self, handler: &mut F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], FragmentHeader),
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut total = 0;
        for image in &mut state.images {
            if total >= fragment_limit {
                break;
            }
            total += image.poll(handler, fragment_limit - total);
        }
        total
    }
}

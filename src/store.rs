//! Id-indexed persistence for request and attribute records
//!
//! Requests and attributes live side by side in one sled tree so that a
//! whole request tree can be written in a single batch and a decision can
//! be targeted at either record kind through one id lookup. All
//! cross-references between records are id strings resolved through this
//! store.

use sled::Batch;

use crate::element::{Attribute, Request};
use crate::error::ChangeError;
use crate::timestamp::TimeStamp;

/// A persisted change element, either shape.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub enum Record {
    #[n(0)]
    Request(#[n(0)] Request),
    #[n(1)]
    Attribute(#[n(0)] Attribute),
}

#[derive(Clone)]
pub struct ChangeStore {
    elements: sled::Tree,
}

impl ChangeStore {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            elements: db.open_tree("change_elements")?,
        })
    }

    pub fn element(&self, id: &str) -> anyhow::Result<Option<Record>> {
        match self.elements.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn request(&self, id: &str) -> anyhow::Result<Option<Request>> {
        match self.element(id)? {
            Some(Record::Request(request)) => Ok(Some(request)),
            _ => Ok(None),
        }
    }

    pub fn require_request(&self, id: &str) -> anyhow::Result<Request> {
        self.request(id)?
            .ok_or_else(|| ChangeError::MissingInstance(id.to_string()).into())
    }

    pub fn attribute(&self, id: &str) -> anyhow::Result<Option<Attribute>> {
        match self.element(id)? {
            Some(Record::Attribute(attribute)) => Ok(Some(attribute)),
            _ => Ok(None),
        }
    }

    pub fn require_attribute(&self, id: &str) -> anyhow::Result<Attribute> {
        self.attribute(id)?
            .ok_or_else(|| ChangeError::MissingInstance(id.to_string()).into())
    }

    /// Load a request's owned attributes in creation order.
    pub fn attributes_of(&self, request: &Request) -> anyhow::Result<Vec<Attribute>> {
        request
            .attributes
            .iter()
            .map(|id| self.require_attribute(id))
            .collect()
    }

    pub fn save_request(&self, request: &Request) -> anyhow::Result<()> {
        let bytes = minicbor::to_vec(Record::Request(request.clone()))?;
        self.elements.insert(request.id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn save_attribute(&self, attribute: &Attribute) -> anyhow::Result<()> {
        let bytes = minicbor::to_vec(Record::Attribute(attribute.clone()))?;
        self.elements.insert(attribute.id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Persist a whole set of records in one batch, as done when a request
    /// tree is created or applied.
    pub fn save_all(&self, requests: &[Request], attributes: &[Attribute]) -> anyhow::Result<()> {
        let mut batch = Batch::default();
        for request in requests {
            batch.insert(
                request.id.as_bytes(),
                minicbor::to_vec(Record::Request(request.clone()))?,
            );
        }
        for attribute in attributes {
            batch.insert(
                attribute.id.as_bytes(),
                minicbor::to_vec(Record::Attribute(attribute.clone()))?,
            );
        }
        self.elements.apply_batch(batch)?;
        Ok(())
    }

    /// Claim the apply slot of a request via compare-and-swap on its
    /// persisted record. Returns the claimed timestamp, or `None` when the
    /// request is already applied (including a lost race), which callers
    /// must treat as a no-op.
    pub fn claim_apply(&self, request_id: &str) -> anyhow::Result<Option<TimeStamp<chrono::Utc>>> {
        loop {
            let Some(old_bytes) = self.elements.get(request_id.as_bytes())? else {
                return Err(ChangeError::MissingInstance(request_id.to_string()).into());
            };
            let Record::Request(mut request) = minicbor::decode::<Record>(&old_bytes)? else {
                return Err(ChangeError::MissingInstance(request_id.to_string()).into());
            };

            if request.state.apply_ts.is_some() {
                return Ok(None);
            }
            let ts = TimeStamp::now();
            request.state.apply_ts = Some(ts.clone());
            let new_bytes = minicbor::to_vec(Record::Request(request))?;

            match self.elements.compare_and_swap(
                request_id.as_bytes(),
                Some(old_bytes),
                Some(new_bytes),
            )? {
                Ok(()) => return Ok(Some(ts)),
                // another writer got in between, re-read and re-check
                Err(_) => continue,
            }
        }
    }
}

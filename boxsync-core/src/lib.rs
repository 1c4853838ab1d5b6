mod client;

pub use client::{
    ApiErrorClass, ListPage, RemoteClient, RemoteEntry, RemoteError, SpaceUsage,
};


mod rotation;

pub mod aquaflower;
